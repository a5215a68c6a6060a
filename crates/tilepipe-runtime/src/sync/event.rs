use crate::error::{DeviceResult, Fault, ProtocolViolation};
use core::cell::{Cell, RefCell};

/// Number of ids available for every [`HardEvent`].
pub const EVENT_ID_NUM: u8 = 8;

/// Identifier of one flag within an event pair.
pub type EventId = u8;

/// Producer/consumer pipe pairs inside a single engine.
///
/// The name reads `producer_consumer`: `Mte2Mte1` is set by the global memory DMA once a stage is
/// filled and waited by the L1 to L0 copy before it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HardEvent {
    Mte2Mte1,
    Mte1Mte2,
    MMte1,
    Mte1M,
    MFix,
    FixM,
    MMte2,
    Mte2M,
    Mte2V,
    VMte2,
    Mte3V,
    VMte3,
    Mte2Mte3,
    Mte3Mte2,
}

impl HardEvent {
    pub const COUNT: usize = 14;

    pub const ALL: [HardEvent; Self::COUNT] = [
        HardEvent::Mte2Mte1,
        HardEvent::Mte1Mte2,
        HardEvent::MMte1,
        HardEvent::Mte1M,
        HardEvent::MFix,
        HardEvent::FixM,
        HardEvent::MMte2,
        HardEvent::Mte2M,
        HardEvent::Mte2V,
        HardEvent::VMte2,
        HardEvent::Mte3V,
        HardEvent::VMte3,
        HardEvent::Mte2Mte3,
        HardEvent::Mte3Mte2,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Execution pipes that a barrier can drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    Mte1,
    Mte2,
    Mte3,
    M,
    V,
    Fix,
    All,
}

/// Binary flags of one core.
///
/// Every core runs its program in order, so a wait on a flag that is not set can never be
/// satisfied later and is reported immediately instead of hanging.
#[derive(Debug)]
pub struct EventTable {
    state: [Cell<u8>; HardEvent::COUNT],
    violation: RefCell<Option<ProtocolViolation>>,
    sets: Cell<u64>,
    waits: Cell<u64>,
    trace: bool,
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EventTable {
    pub fn new(trace: bool) -> Self {
        Self {
            state: Default::default(),
            violation: RefCell::new(None),
            sets: Cell::new(0),
            waits: Cell::new(0),
            trace,
        }
    }

    fn mask(event: HardEvent, id: EventId) -> DeviceResult<u8> {
        if id >= EVENT_ID_NUM {
            return Err(ProtocolViolation::InvalidEventId { event, id }.into());
        }
        Ok(1 << id)
    }

    pub fn set_flag(&self, event: HardEvent, id: EventId) -> DeviceResult {
        let mask = Self::mask(event, id)?;
        let cell = &self.state[event.index()];

        if cell.get() & mask != 0 {
            return Err(ProtocolViolation::DoubleSet { event, id }.into());
        }
        if self.trace {
            log::trace!("set_flag {event:?}[{id}]");
        }
        cell.set(cell.get() | mask);
        self.sets.set(self.sets.get() + 1);
        Ok(())
    }

    pub fn wait_flag(&self, event: HardEvent, id: EventId) -> DeviceResult {
        let mask = Self::mask(event, id)?;
        let cell = &self.state[event.index()];

        if cell.get() & mask == 0 {
            return Err(ProtocolViolation::WaitWithoutSet { event, id }.into());
        }
        if self.trace {
            log::trace!("wait_flag {event:?}[{id}]");
        }
        cell.set(cell.get() & !mask);
        self.waits.set(self.waits.get() + 1);
        Ok(())
    }

    /// Set immediately followed by the matching wait, ordering two pipes once.
    pub fn sync(&self, event: HardEvent, id: EventId) -> DeviceResult {
        self.set_flag(event, id)?;
        self.wait_flag(event, id)
    }

    pub fn is_set(&self, event: HardEvent, id: EventId) -> bool {
        id < EVENT_ID_NUM && self.state[event.index()].get() & (1 << id) != 0
    }

    /// Keeps the first violation observed from a context that cannot return an error.
    pub fn record(&self, violation: ProtocolViolation) {
        log::error!("{violation}");
        let mut slot = self.violation.borrow_mut();
        if slot.is_none() {
            *slot = Some(violation);
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.trace
    }

    pub fn sets(&self) -> u64 {
        self.sets.get()
    }

    pub fn waits(&self) -> u64 {
        self.waits.get()
    }

    /// Checks the table at kernel exit: recorded violations first, then flags left set.
    pub fn finish(&self) -> DeviceResult {
        if let Some(violation) = self.violation.borrow_mut().take() {
            return Err(Fault::Protocol(violation));
        }

        for event in HardEvent::ALL {
            let bits = self.state[event.index()].get();
            if bits != 0 {
                let id = bits.trailing_zeros() as u8;
                return Err(ProtocolViolation::Undrained { event, id }.into());
            }
        }
        Ok(())
    }
}
