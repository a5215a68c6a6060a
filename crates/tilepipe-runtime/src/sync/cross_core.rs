use crate::error::{DeviceResult, Fault, ProtocolViolation, WaitTarget};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Number of cross core flag ids.
pub const CROSS_FLAG_NUM: u8 = 16;
/// Hardware limit of pending sets on one flag counter.
pub const FLAG_COUNTER_MAX: u32 = 15;
/// Sets a with-reverse flag accepts before the setter waits for the reverse acknowledgement.
pub const REVERSE_DEPTH: u32 = FLAG_COUNTER_MAX;

/// Counted flag shared between a matrix engine and its vector engines.
///
/// A plain flag accepts a single pending set per id and per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct CrossCoreFlag {
    pub id: u8,
}

/// Flag pair that can be set repeatedly inside a loop.
///
/// The setter may run up to [`REVERSE_DEPTH`] sets ahead of the waiter; after that it blocks on
/// `reverse_id`, which the waiter sets once every [`REVERSE_DEPTH`] waits. No explicit reset is
/// ever needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossCoreFlagWithReverse {
    pub id: u8,
    pub reverse_id: u8,
    pub(crate) count: u32,
}

impl CrossCoreFlagWithReverse {
    pub fn new(id: u8, reverse_id: u8) -> Self {
        Self {
            id,
            reverse_id,
            count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    ToAiv,
    ToAic,
}

/// Shared counters backing the cross core flags of one launch.
#[derive(Debug)]
pub(crate) struct SyncBoard {
    counters: Vec<AtomicU32>,
    aiv_per_aic: usize,
    aiv_total: usize,
    barrier_arrived: AtomicUsize,
    barrier_generation: AtomicUsize,
    abort: AtomicBool,
    watchdog: Duration,
}

impl SyncBoard {
    pub(crate) fn new(aic_num: usize, aiv_per_aic: usize, watchdog: Duration) -> Self {
        let len = aic_num * aiv_per_aic * CROSS_FLAG_NUM as usize * 2;
        Self {
            counters: (0..len).map(|_| AtomicU32::new(0)).collect(),
            aiv_per_aic,
            aiv_total: aic_num * aiv_per_aic,
            barrier_arrived: AtomicUsize::new(0),
            barrier_generation: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            watchdog,
        }
    }

    fn index(&self, aic: usize, sub: usize, id: u8, direction: Direction) -> usize {
        let lane = aic * self.aiv_per_aic + sub;
        let slot = lane * CROSS_FLAG_NUM as usize + id as usize;
        slot * 2 + direction as usize
    }

    fn check_id(id: u8) -> DeviceResult {
        if id >= CROSS_FLAG_NUM {
            return Err(ProtocolViolation::InvalidCrossFlag { id }.into());
        }
        Ok(())
    }

    pub(crate) fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Increments the counter of one lane, refusing to go past `max_pending`.
    pub(crate) fn set(
        &self,
        aic: usize,
        sub: usize,
        id: u8,
        direction: Direction,
        max_pending: u32,
    ) -> DeviceResult {
        Self::check_id(id)?;
        let counter = &self.counters[self.index(aic, sub, id, direction)];

        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                (value < max_pending).then_some(value + 1)
            })
            .map(|_| ())
            .map_err(|_| ProtocolViolation::CrossFlagOverflow { id, max_pending }.into())
    }

    /// Blocks until the counter of one lane is positive, then consumes one set.
    pub(crate) fn wait(&self, aic: usize, sub: usize, id: u8, direction: Direction) -> DeviceResult {
        Self::check_id(id)?;
        let counter = &self.counters[self.index(aic, sub, id, direction)];

        self.spin_until(WaitTarget::CrossFlag(id), || {
            counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                    value.checked_sub(1)
                })
                .is_ok()
        })
    }

    /// Rendezvous of every vector engine of the launch.
    pub(crate) fn aiv_barrier(&self) -> DeviceResult {
        let generation = self.barrier_generation.load(Ordering::Acquire);

        if self.barrier_arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.aiv_total {
            self.barrier_arrived.store(0, Ordering::Release);
            self.barrier_generation.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        self.spin_until(WaitTarget::AivBarrier, || {
            self.barrier_generation.load(Ordering::Acquire) != generation
        })
    }

    fn spin_until(&self, target: WaitTarget, mut ready: impl FnMut() -> bool) -> DeviceResult {
        let start = Instant::now();
        let mut spins = 0u32;

        loop {
            if ready() {
                return Ok(());
            }
            if self.is_aborted() {
                return Err(Fault::Aborted);
            }

            spins += 1;
            if spins < 64 {
                core::hint::spin_loop();
                continue;
            }

            let waited = start.elapsed();
            if waited > self.watchdog {
                return Err(Fault::Hang {
                    on: target,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn plain_flag_accepts_one_pending_set() {
        let board = SyncBoard::new(1, 2, Duration::from_millis(50));
        board.set(0, 0, 3, Direction::ToAiv, 1).unwrap();

        assert_eq!(
            board.set(0, 0, 3, Direction::ToAiv, 1),
            Err(Fault::Protocol(ProtocolViolation::CrossFlagOverflow {
                id: 3,
                max_pending: 1
            }))
        );
        board.wait(0, 0, 3, Direction::ToAiv).unwrap();
        board.set(0, 0, 3, Direction::ToAiv, 1).unwrap();
    }

    #[test_log::test]
    fn lanes_and_directions_are_independent() {
        let board = SyncBoard::new(2, 2, Duration::from_millis(50));
        board.set(1, 1, 0, Direction::ToAic, 1).unwrap();
        board.set(1, 1, 0, Direction::ToAiv, 1).unwrap();
        board.set(0, 1, 0, Direction::ToAic, 1).unwrap();

        board.wait(1, 1, 0, Direction::ToAic).unwrap();
        board.wait(1, 1, 0, Direction::ToAiv).unwrap();
        board.wait(0, 1, 0, Direction::ToAic).unwrap();
    }

    #[test_log::test]
    fn wait_times_out() {
        let board = SyncBoard::new(1, 2, Duration::from_millis(20));

        assert!(matches!(
            board.wait(0, 0, 1, Direction::ToAic),
            Err(Fault::Hang {
                on: WaitTarget::CrossFlag(1),
                ..
            })
        ));
    }

    #[test_log::test]
    fn abort_releases_waiters() {
        let board = SyncBoard::new(1, 2, Duration::from_secs(30));
        board.abort();

        assert_eq!(board.wait(0, 1, 2, Direction::ToAiv), Err(Fault::Aborted));
    }

    #[test_log::test]
    fn barrier_releases_all_lanes() {
        let board = SyncBoard::new(2, 2, Duration::from_secs(10));

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| board.aiv_barrier()))
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_ok());
            }
        });

        // The barrier is reusable.
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| board.aiv_barrier()))
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap().is_ok());
            }
        });
    }
}
