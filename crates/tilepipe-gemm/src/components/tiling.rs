use core::fmt::Display;
use tilepipe_runtime::arch::{ArchTag, BYTE_PER_C0, C0_NUM_PER_FRACTAL};

use super::{FormattedConfigError, GemmCoord, GemmTypes, MatmulSetupError};

/// Two level tile shape of a block pipeline.
///
/// `L1` is the outer tile staged in the staging tier, `L0` the inner tile fed to the operand
/// tiers. Both are fixed at compile time.
pub trait BlockTiling: Send + Sync + 'static {
    const L1: GemmCoord;
    const L0: GemmCoord;
    /// Rotating buffer slots per tier.
    const STAGES: usize = 2;
}

/// Tiling spelled out with const generics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tiling<
    const L1_M: usize,
    const L1_N: usize,
    const L1_K: usize,
    const L0_M: usize,
    const L0_N: usize,
    const L0_K: usize,
>;

impl<
    const L1_M: usize,
    const L1_N: usize,
    const L1_K: usize,
    const L0_M: usize,
    const L0_N: usize,
    const L0_K: usize,
> BlockTiling for Tiling<L1_M, L1_N, L1_K, L0_M, L0_N, L0_K>
{
    const L1: GemmCoord = GemmCoord::new(L1_M, L1_N, L1_K);
    const L0: GemmCoord = GemmCoord::new(L0_M, L0_N, L0_K);
}

/// Default tiling of 16-bit operands.
pub type TilingF16 = Tiling<128, 256, 256, 128, 256, 64>;
/// Default tiling of 32-bit operands.
pub type TilingF32 = Tiling<128, 128, 128, 128, 128, 32>;
/// Default tiling of 8-bit operands.
pub type TilingI8 = Tiling<128, 256, 512, 128, 256, 128>;

/// Capacities the tile shape is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCaps {
    pub l1: usize,
    pub l0a: usize,
    pub l0b: usize,
    pub l0c: usize,
}

impl TierCaps {
    pub const fn of<A: ArchTag>() -> Self {
        Self {
            l1: A::L1_SIZE,
            l0a: A::L0A_SIZE,
            l0b: A::L0B_SIZE,
            l0c: A::L0C_SIZE,
        }
    }
}

/// A tile shape together with the element widths it will hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub l1: GemmCoord,
    pub l0: GemmCoord,
    pub stages: usize,
    pub size_a: usize,
    pub size_b: usize,
    pub size_acc: usize,
    pub unit_flag: bool,
}

impl TileRequest {
    pub const fn of<T: GemmTypes, Til: BlockTiling>(unit_flag: bool) -> Self {
        Self {
            l1: Til::L1,
            l0: Til::L0,
            stages: Til::STAGES,
            size_a: size_of::<T::A>(),
            size_b: size_of::<T::B>(),
            size_acc: size_of::<T::Acc>(),
            unit_flag,
        }
    }
}

/// Why a tile shape cannot be laid out on chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileViolation {
    NoStages,
    EmptyTile,
    L1Overflow { required: usize, capacity: usize },
    L0AOverflow { required: usize, capacity: usize },
    L0BOverflow { required: usize, capacity: usize },
    L0COverflow { required: usize, capacity: usize },
    MismatchedM { l1: usize, l0: usize },
    MismatchedN { l1: usize, l0: usize },
    KNotDivisible { l1: usize, l0: usize },
    Misaligned { dim: usize, align: usize },
    UnitFlagWith8Bit,
}

impl Display for TileViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TileViolation::NoStages => f.write_str("at least one buffer stage is required"),
            TileViolation::EmptyTile => f.write_str("tile dimensions must be non-zero"),
            TileViolation::L1Overflow { required, capacity } => {
                write!(f, "L1 tiles need {required} bytes, L1 holds {capacity}")
            }
            TileViolation::L0AOverflow { required, capacity } => {
                write!(f, "L0A tiles need {required} bytes, L0A holds {capacity}")
            }
            TileViolation::L0BOverflow { required, capacity } => {
                write!(f, "L0B tiles need {required} bytes, L0B holds {capacity}")
            }
            TileViolation::L0COverflow { required, capacity } => {
                write!(f, "the accumulator tile needs {required} bytes, L0C holds {capacity}")
            }
            TileViolation::MismatchedM { l1, l0 } => {
                write!(f, "L1 and L0 tiles must share M, got {l1} and {l0}")
            }
            TileViolation::MismatchedN { l1, l0 } => {
                write!(f, "L1 and L0 tiles must share N, got {l1} and {l0}")
            }
            TileViolation::KNotDivisible { l1, l0 } => {
                write!(f, "L0 K ({l0}) must divide L1 K ({l1})")
            }
            TileViolation::Misaligned { dim, align } => {
                write!(f, "tile dimension {dim} is not a multiple of {align}")
            }
            TileViolation::UnitFlagWith8Bit => {
                f.write_str("the unit flag cannot be used with 8-bit operands")
            }
        }
    }
}

/// Byte footprint of every tier used by a block pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub stages: usize,
    /// One stage of the left operand in the staging tier.
    pub l1_a_bytes: usize,
    pub l1_b_bytes: usize,
    pub l0a_bytes: usize,
    pub l0b_bytes: usize,
    pub l0c_bytes: usize,
}

impl BufferPlan {
    /// Runtime mirror of the compile time capacity checks.
    pub fn new(request: TileRequest, caps: TierCaps) -> Result<Self, MatmulSetupError> {
        validate(request, caps).map_err(|violation| {
            MatmulSetupError::InvalidConfig(FormattedConfigError::new(move || {
                format!("Tile {} / {}: {violation}", request.l1, request.l0)
            }))
        })
    }

    pub fn of<A: ArchTag, T: GemmTypes, Til: BlockTiling>(
        unit_flag: bool,
    ) -> Result<Self, MatmulSetupError> {
        Self::new(TileRequest::of::<T, Til>(unit_flag), TierCaps::of::<A>())
    }

    /// Bytes of the staging tier taken by all stages.
    pub fn l1_total(&self) -> usize {
        (self.l1_a_bytes + self.l1_b_bytes) * self.stages
    }
}

/// Checks a tile shape against tier capacities.
pub const fn validate(request: TileRequest, caps: TierCaps) -> Result<BufferPlan, TileViolation> {
    let TileRequest {
        l1,
        l0,
        stages,
        size_a,
        size_b,
        size_acc,
        unit_flag,
    } = request;

    if stages == 0 {
        return Err(TileViolation::NoStages);
    }
    if l1.m == 0 || l1.n == 0 || l1.k == 0 || l0.k == 0 {
        return Err(TileViolation::EmptyTile);
    }
    if l1.m != l0.m {
        return Err(TileViolation::MismatchedM { l1: l1.m, l0: l0.m });
    }
    if l1.n != l0.n {
        return Err(TileViolation::MismatchedN { l1: l1.n, l0: l0.n });
    }
    if l1.k % l0.k != 0 {
        return Err(TileViolation::KNotDivisible { l1: l1.k, l0: l0.k });
    }

    let narrow = if size_a < size_b { size_a } else { size_b };
    let per_c0 = BYTE_PER_C0 / narrow;
    let align = if per_c0 > C0_NUM_PER_FRACTAL {
        per_c0
    } else {
        C0_NUM_PER_FRACTAL
    };
    let dims = [l1.m, l1.n, l1.k, l0.k];
    let mut i = 0;
    while i < dims.len() {
        if dims[i] % align != 0 {
            return Err(TileViolation::Misaligned {
                dim: dims[i],
                align,
            });
        }
        i += 1;
    }

    let l1_a_bytes = l1.m * l1.k * size_a;
    let l1_b_bytes = l1.k * l1.n * size_b;
    let l1_total = (l1_a_bytes + l1_b_bytes) * stages;
    if l1_total > caps.l1 {
        return Err(TileViolation::L1Overflow {
            required: l1_total,
            capacity: caps.l1,
        });
    }

    let l0a_bytes = l0.m * l0.k * size_a;
    if l0a_bytes * stages > caps.l0a {
        return Err(TileViolation::L0AOverflow {
            required: l0a_bytes * stages,
            capacity: caps.l0a,
        });
    }
    let l0b_bytes = l0.k * l0.n * size_b;
    if l0b_bytes * stages > caps.l0b {
        return Err(TileViolation::L0BOverflow {
            required: l0b_bytes * stages,
            capacity: caps.l0b,
        });
    }
    let l0c_bytes = l0.m * l0.n * size_acc;
    if l0c_bytes > caps.l0c {
        return Err(TileViolation::L0COverflow {
            required: l0c_bytes,
            capacity: caps.l0c,
        });
    }

    if unit_flag && (size_a == 1 || size_b == 1) {
        return Err(TileViolation::UnitFlagWith8Bit);
    }

    Ok(BufferPlan {
        stages,
        l1_a_bytes,
        l1_b_bytes,
        l0a_bytes,
        l0b_bytes,
        l0c_bytes,
    })
}

/// Whether `validate` accepts the request, usable in const assertions.
pub const fn is_valid(request: TileRequest, caps: TierCaps) -> bool {
    matches!(validate(request, caps), Ok(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{MatmulTypes, RowMajor};
    use half::f16;
    use tilepipe_runtime::arch::AtlasA2;

    type F16 = MatmulTypes<f16, RowMajor, f16, RowMajor, f16>;
    type F32 = MatmulTypes<f32, RowMajor, f32, RowMajor, f32>;
    type I8 = MatmulTypes<i8, RowMajor, i8, RowMajor, i32>;

    #[test_log::test]
    fn default_tilings_fit() {
        let f16_plan = BufferPlan::of::<AtlasA2, F16, TilingF16>(true).unwrap();
        let f32_plan = BufferPlan::of::<AtlasA2, F32, TilingF32>(true).unwrap();
        let i8_plan = BufferPlan::of::<AtlasA2, I8, TilingI8>(false).unwrap();

        assert_eq!(f16_plan.l1_total(), 384 * 1024);
        assert_eq!(f16_plan.l0c_bytes, 128 * 1024);
        assert_eq!(f32_plan.l0a_bytes, 16 * 1024);
        assert_eq!(i8_plan.l0b_bytes * 2, 64 * 1024);
    }

    #[test_log::test]
    fn oversized_l1_is_reported() {
        let mut request = TileRequest::of::<F16, TilingF16>(false);
        request.l1 = GemmCoord::new(256, 256, 512);
        request.l0 = GemmCoord::new(256, 256, 64);

        assert_eq!(
            validate(request, TierCaps::of::<AtlasA2>()),
            Err(TileViolation::L1Overflow {
                required: 1024 * 1024,
                capacity: 512 * 1024
            })
        );
        assert!(!is_valid(request, TierCaps::of::<AtlasA2>()));
    }

    #[test_log::test]
    fn unit_flag_rejected_for_8_bit() {
        let request = TileRequest::of::<I8, TilingI8>(true);

        assert_eq!(
            validate(request, TierCaps::of::<AtlasA2>()),
            Err(TileViolation::UnitFlagWith8Bit)
        );
    }

    #[test_log::test]
    fn l0_must_share_m_and_divide_k() {
        let mut request = TileRequest::of::<F16, TilingF16>(false);
        request.l0 = GemmCoord::new(64, 256, 64);
        assert_eq!(
            validate(request, TierCaps::of::<AtlasA2>()),
            Err(TileViolation::MismatchedM { l1: 128, l0: 64 })
        );

        request.l0 = GemmCoord::new(128, 256, 96);
        assert_eq!(
            validate(request, TierCaps::of::<AtlasA2>()),
            Err(TileViolation::KNotDivisible { l1: 256, l0: 96 })
        );
    }

    #[test_log::test]
    fn setup_error_names_the_tier() {
        let mut request = TileRequest::of::<F32, TilingF32>(false);
        request.l0 = GemmCoord::new(128, 128, 128);

        let err = BufferPlan::new(request, TierCaps::of::<AtlasA2>()).unwrap_err();
        assert!(err.to_string().contains("L0A tiles need 131072 bytes"));
    }
}
