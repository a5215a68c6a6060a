use serde::{Deserialize, Serialize};

/// Bytes in one C0 unit, the innermost contiguous run of a fractal row.
pub const BYTE_PER_C0: usize = 32;
/// Number of C0 units stacked in one fractal.
pub const C0_NUM_PER_FRACTAL: usize = 16;
/// Bytes in one fractal block.
pub const BYTE_PER_FRACTAL: usize = BYTE_PER_C0 * C0_NUM_PER_FRACTAL;
/// Granularity of vector engine data movement.
pub const BYTE_PER_BLK: usize = 32;
/// Side of the accumulator fractal, which is always 16x16 elements.
pub const L0C_FRACTAL: usize = 16;

/// Static description of one accelerator generation.
///
/// Algorithms read capacities from here and never hard-code them, so that a tile shape checked
/// against one architecture can be rejected on another.
pub trait ArchTag: Send + Sync + 'static {
    /// Human readable name, compared against the device at launch.
    const NAME: &'static str;

    /// Staging tier.
    const L1_SIZE: usize;
    /// Left operand tier.
    const L0A_SIZE: usize;
    /// Right operand tier.
    const L0B_SIZE: usize;
    /// Accumulator tier.
    const L0C_SIZE: usize;
    /// Vector engine scratch tier.
    const UB_SIZE: usize;

    /// Upper bound of matrix engines on one die.
    const MAX_AIC_CORES: usize;
    /// Vector engines paired with every matrix engine.
    const AIV_PER_AIC: usize;

    /// Runtime mirror of the constants, used to size the simulated tiers.
    fn spec() -> ArchSpec {
        ArchSpec {
            name: Self::NAME.into(),
            l1_size: Self::L1_SIZE,
            l0a_size: Self::L0A_SIZE,
            l0b_size: Self::L0B_SIZE,
            l0c_size: Self::L0C_SIZE,
            ub_size: Self::UB_SIZE,
            max_aic_cores: Self::MAX_AIC_CORES,
            aiv_per_aic: Self::AIV_PER_AIC,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AtlasA2;

impl ArchTag for AtlasA2 {
    const NAME: &'static str = "atlas-a2";

    const L1_SIZE: usize = 512 * 1024;
    const L0A_SIZE: usize = 64 * 1024;
    const L0B_SIZE: usize = 64 * 1024;
    const L0C_SIZE: usize = 128 * 1024;
    const UB_SIZE: usize = 192 * 1024;

    const MAX_AIC_CORES: usize = 20;
    const AIV_PER_AIC: usize = 2;
}

/// Capacities of a concrete device, as seen at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchSpec {
    pub name: String,
    pub l1_size: usize,
    pub l0a_size: usize,
    pub l0b_size: usize,
    pub l0c_size: usize,
    pub ub_size: usize,
    pub max_aic_cores: usize,
    pub aiv_per_aic: usize,
}

impl ArchSpec {
    pub fn capacity(&self, tier: TierKind) -> usize {
        match tier {
            TierKind::L1 => self.l1_size,
            TierKind::L0A => self.l0a_size,
            TierKind::L0B => self.l0b_size,
            TierKind::L0C => self.l0c_size,
            TierKind::Ub => self.ub_size,
        }
    }
}

/// On-chip memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierKind {
    L1,
    L0A,
    L0B,
    L0C,
    Ub,
}

impl TierKind {
    /// Tiers owned by a matrix engine.
    pub const AIC: [TierKind; 4] = [TierKind::L1, TierKind::L0A, TierKind::L0B, TierKind::L0C];
    /// Tiers owned by a vector engine.
    pub const AIV: [TierKind; 1] = [TierKind::Ub];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl core::fmt::Display for TierKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TierKind::L1 => "L1",
            TierKind::L0A => "L0A",
            TierKind::L0B => "L0B",
            TierKind::L0C => "L0C",
            TierKind::Ub => "UB",
        };
        f.write_str(name)
    }
}

/// Rounds `value` up to a multiple of `align`. An alignment of zero leaves the value untouched.
pub const fn round_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Rounds `value` down to a multiple of `align`.
pub const fn round_down(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn spec_mirrors_constants() {
        let spec = AtlasA2::spec();

        assert_eq!(spec.capacity(TierKind::L1), 512 * 1024);
        assert_eq!(spec.capacity(TierKind::L0C), 128 * 1024);
        assert_eq!(spec.capacity(TierKind::Ub), 192 * 1024);
        assert_eq!(spec.aiv_per_aic, 2);
    }

    #[test_log::test]
    fn rounding() {
        assert_eq!(round_up(200, 16), 208);
        assert_eq!(round_up(256, 128), 256);
        assert_eq!(round_up(7, 0), 7);
        assert_eq!(round_down(200, 128), 128);
    }
}
