use core::fmt::Display;
use core::ops::AddAssign;

/// Instruction and traffic counters of one core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipeStats {
    /// Matrix multiply-accumulate instructions.
    pub mmad: u64,
    /// Pipe barriers issued.
    pub barriers: u64,
    /// Accumulator round-trips skipped thanks to the unit flag.
    pub unit_flag_skips: u64,
    pub gm_read_bytes: u64,
    pub gm_write_bytes: u64,
    /// Bytes moved between two on-chip tiers.
    pub local_copy_bytes: u64,
    /// Vector instructions, one per processed tile.
    pub vector_ops: u64,
    pub event_sets: u64,
    pub event_waits: u64,
    pub cross_sets: u64,
    pub cross_waits: u64,
}

impl AddAssign for PipeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.mmad += rhs.mmad;
        self.barriers += rhs.barriers;
        self.unit_flag_skips += rhs.unit_flag_skips;
        self.gm_read_bytes += rhs.gm_read_bytes;
        self.gm_write_bytes += rhs.gm_write_bytes;
        self.local_copy_bytes += rhs.local_copy_bytes;
        self.vector_ops += rhs.vector_ops;
        self.event_sets += rhs.event_sets;
        self.event_waits += rhs.event_waits;
        self.cross_sets += rhs.cross_sets;
        self.cross_waits += rhs.cross_waits;
    }
}

impl Display for PipeStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "mmad={} barriers={} unit_flag_skips={} gm_read={}B gm_write={}B local={}B vector={} events={}/{} cross={}/{}",
            self.mmad,
            self.barriers,
            self.unit_flag_skips,
            self.gm_read_bytes,
            self.gm_write_bytes,
            self.local_copy_bytes,
            self.vector_ops,
            self.event_sets,
            self.event_waits,
            self.cross_sets,
            self.cross_waits,
        )
    }
}
