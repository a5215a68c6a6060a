use crate::arch::TierKind;
use crate::device::CoreId;
use crate::sync::HardEvent;
use thiserror::Error;

/// Ordering mistake committed by device code.
///
/// On hardware these surface as hangs or silently wrong results. The simulated device turns them
/// into a fault of the offending core.
#[derive(Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Event {event:?}[{id}] was set twice without an intervening wait")]
    DoubleSet { event: HardEvent, id: u8 },

    #[error("Wait on event {event:?}[{id}] that was never set")]
    WaitWithoutSet { event: HardEvent, id: u8 },

    #[error("Event {event:?}[{id}] was still set when the kernel exited")]
    Undrained { event: HardEvent, id: u8 },

    #[error("Event id {id} is out of range for {event:?}")]
    InvalidEventId { event: HardEvent, id: u8 },

    #[error("Stage guard for {event:?}[{id}] was dropped without being {expected}")]
    UnsignaledStage {
        event: HardEvent,
        id: u8,
        expected: &'static str,
    },

    #[error("Cross core flag {id} was set more than {max_pending} times without a wait")]
    CrossFlagOverflow { id: u8, max_pending: u32 },

    #[error("Cross core flag {id} is reserved or out of range")]
    InvalidCrossFlag { id: u8 },

    #[error("Cross core operation is not available on {0}")]
    WrongCoreType(&'static str),
}

impl core::fmt::Debug for ProtocolViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

/// Reason a simulated core stopped executing.
#[derive(Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Protocol violation\nCaused by:\n  {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error(
        "Access out of bounds in {tier}: {offset}..{end} exceeds {capacity} bytes",
        end = .offset + .len
    )]
    TierOutOfBounds {
        tier: TierKind,
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Access out of bounds in global memory: {addr}..{end} exceeds {size} bytes", end = .addr + .len)]
    GlobalOutOfBounds { addr: usize, len: usize, size: usize },

    #[error("Tier {tier} cannot hold {requested} more bytes ({available} available)")]
    TierExhausted {
        tier: TierKind,
        requested: usize,
        available: usize,
    },

    #[error("The written tensor aliases an input tier ({tier})")]
    TierAliasing { tier: TierKind },

    #[error("Misaligned {dtype_size} byte view at offset {offset} of {tier}")]
    Misaligned {
        tier: TierKind,
        offset: usize,
        dtype_size: usize,
    },

    #[error("Waited {waited_ms} ms on {on} without a matching set")]
    Hang { on: WaitTarget, waited_ms: u64 },

    #[error("Aborted because another core faulted")]
    Aborted,
}

impl core::fmt::Debug for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

/// What a blocked core was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    CrossFlag(u8),
    AivBarrier,
}

impl core::fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WaitTarget::CrossFlag(id) => write!(f, "cross core flag {id}"),
            WaitTarget::AivBarrier => f.write_str("the vector engine barrier"),
        }
    }
}

/// Result type of device side code.
pub type DeviceResult<T = ()> = Result<T, Fault>;

/// Host side global memory allocation failure.
#[derive(Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Global memory exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Buffer of {buffer_len} bytes cannot hold {requested} bytes")]
    BufferTooSmall { buffer_len: usize, requested: usize },

    #[error("Buffer at {addr:#x} was released")]
    Released { addr: usize },
}

impl core::fmt::Debug for AllocationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

/// Failure of a kernel launch.
#[derive(Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Kernel {kernel} faulted on {core}\nCaused by:\n  {fault}")]
    Fault {
        kernel: String,
        core: CoreId,
        fault: Fault,
    },

    #[error("Kernel {kernel} panicked on {core}: {message}")]
    Panic {
        kernel: String,
        core: CoreId,
        message: String,
    },

    #[error("Invalid block dim {block_dim}, the device has {available} matrix engines")]
    InvalidBlockDim { block_dim: usize, available: usize },

    #[error("Kernel built for {expected} cannot run on a {actual} device")]
    ArchMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("An allocation failed while preparing the launch\nCaused by:\n  {0}")]
    Allocation(#[from] AllocationError),
}

impl core::fmt::Debug for LaunchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}
