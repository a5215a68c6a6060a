use super::event::{EventId, EventTable, HardEvent};
use crate::error::{DeviceResult, ProtocolViolation};
use crate::memory::LocalTensor;
use bytemuck::Pod;
use std::rc::Rc;

/// One rotating buffer slot of a pipeline.
///
/// The slot owns a region of an on-chip tier and two flags sharing one id: `refill` is set by
/// the consumer once it no longer reads the region, `consume` is set by the producer once the
/// region holds fresh data. Ownership alternates strictly between the two sides.
pub struct StageSlot<E> {
    tensor: LocalTensor<E>,
    refill: HardEvent,
    consume: HardEvent,
    id: EventId,
}

impl<E> Clone for StageSlot<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for StageSlot<E> {}

impl<E> core::fmt::Debug for StageSlot<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageSlot")
            .field("tensor", &self.tensor)
            .field("refill", &self.refill)
            .field("consume", &self.consume)
            .field("id", &self.id)
            .finish()
    }
}

impl<E: Pod> StageSlot<E> {
    pub fn new(tensor: LocalTensor<E>, refill: HardEvent, consume: HardEvent, id: EventId) -> Self {
        Self {
            tensor,
            refill,
            consume,
            id,
        }
    }

    pub fn tensor(&self) -> LocalTensor<E> {
        self.tensor
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Arms the slot at kernel entry so the first producer does not block.
    pub fn prime(&self, events: &EventTable) -> DeviceResult {
        events.set_flag(self.refill, self.id)
    }

    /// Takes back the refill token at kernel exit.
    pub fn drain(&self, events: &EventTable) -> DeviceResult {
        events.wait_flag(self.refill, self.id)
    }

    /// Waits until the slot may be refilled.
    pub fn acquire_write(&self, events: &Rc<EventTable>) -> DeviceResult<StageWrite<E>> {
        events.wait_flag(self.refill, self.id)?;
        Ok(StageWrite {
            slot: *self,
            events: events.clone(),
            signaled: false,
        })
    }

    /// Waits until the slot holds data for the consumer.
    pub fn acquire_read(&self, events: &Rc<EventTable>) -> DeviceResult<StageRead<E>> {
        events.wait_flag(self.consume, self.id)?;
        Ok(StageRead {
            slot: *self,
            events: events.clone(),
            signaled: false,
        })
    }
}

/// Producer side ownership of a stage.
#[must_use = "a stage acquired for writing must be committed"]
pub struct StageWrite<E: Pod> {
    slot: StageSlot<E>,
    events: Rc<EventTable>,
    signaled: bool,
}

impl<E: Pod> StageWrite<E> {
    pub fn tensor(&self) -> LocalTensor<E> {
        self.slot.tensor
    }

    /// Hands the stage to the consumer.
    pub fn commit(mut self) -> DeviceResult {
        self.signaled = true;
        self.events.set_flag(self.slot.consume, self.slot.id)
    }
}

impl<E: Pod> Drop for StageWrite<E> {
    fn drop(&mut self) {
        if !self.signaled && !std::thread::panicking() {
            self.events.record(ProtocolViolation::UnsignaledStage {
                event: self.slot.consume,
                id: self.slot.id,
                expected: "committed",
            });
        }
    }
}

/// Consumer side ownership of a stage.
#[must_use = "a stage acquired for reading must be released"]
pub struct StageRead<E: Pod> {
    slot: StageSlot<E>,
    events: Rc<EventTable>,
    signaled: bool,
}

impl<E: Pod> StageRead<E> {
    pub fn tensor(&self) -> LocalTensor<E> {
        self.slot.tensor
    }

    /// Gives the stage back to the producer.
    pub fn release(mut self) -> DeviceResult {
        self.signaled = true;
        self.events.set_flag(self.slot.refill, self.slot.id)
    }
}

impl<E: Pod> Drop for StageRead<E> {
    fn drop(&mut self) {
        if !self.signaled && !std::thread::panicking() {
            self.events.record(ProtocolViolation::UnsignaledStage {
                event: self.slot.refill,
                id: self.slot.id,
                expected: "released",
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TierKind;
    use crate::error::Fault;

    fn slot() -> StageSlot<f32> {
        StageSlot::new(
            LocalTensor::new(TierKind::L1, 0, 64),
            HardEvent::Mte1Mte2,
            HardEvent::Mte2Mte1,
            1,
        )
    }

    #[test_log::test]
    fn alternating_ownership() {
        let events = Rc::new(EventTable::default());
        let slot = slot();
        slot.prime(&events).unwrap();

        for _ in 0..3 {
            let write = slot.acquire_write(&events).unwrap();
            assert_eq!(write.tensor().len(), 64);
            write.commit().unwrap();

            let read = slot.acquire_read(&events).unwrap();
            read.release().unwrap();
        }

        slot.drain(&events).unwrap();
        assert!(events.finish().is_ok());
    }

    #[test_log::test]
    fn refill_before_release_is_rejected() {
        let events = Rc::new(EventTable::default());
        let slot = slot();
        slot.prime(&events).unwrap();

        slot.acquire_write(&events).unwrap().commit().unwrap();

        assert!(slot.acquire_write(&events).is_err());
    }

    #[test_log::test]
    fn dropped_guard_is_recorded() {
        let events = Rc::new(EventTable::default());
        let slot = slot();
        slot.prime(&events).unwrap();

        let write = slot.acquire_write(&events).unwrap();
        drop(write);

        assert_eq!(
            events.finish(),
            Err(Fault::Protocol(ProtocolViolation::UnsignaledStage {
                event: HardEvent::Mte2Mte1,
                id: 1,
                expected: "committed",
            }))
        );
    }
}
