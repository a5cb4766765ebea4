//! Cross-group rendezvous. One arrival per group, every lane waits for all groups.
//!
//! Single-use: once released, a latch must be `reset` (host side, between
//! launches) before the next rendezvous.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::barrier::GroupContext;
use super::spin::SyncError;

#[derive(Debug)]
pub struct GroupLatch {
    counter: AtomicUsize,
    expected: usize,
}

impl GroupLatch {
    /// `expected` is the number of groups that will arrive.
    pub const fn new(expected: usize) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            expected,
        }
    }

    #[inline(always)]
    pub const fn expected(&self) -> usize {
        self.expected
    }

    #[inline(always)]
    pub fn arrived(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_released(&self) -> bool {
        self.arrived() >= self.expected
    }

    /// Barrier, lane 0 arrives for its group, everyone spins until all groups
    /// arrived, barrier.
    pub fn arrive_and_wait<G: GroupContext>(&self, lane: &G) -> Result<(), SyncError> {
        lane.group_barrier()?;

        if lane.local_linear_id() == 0 {
            self.claim_arrival()?;
        }

        lane.spin_budget().spin_until(lane.abort_flag(), || {
            self.counter.load(Ordering::Acquire) == self.expected
        })?;

        lane.group_barrier()
    }

    /// Count one arrival. The counter never passes `expected`, so lanes still
    /// waiting on a released latch are not stranded by a late arrival.
    #[inline]
    fn claim_arrival(&self) -> Result<(), SyncError> {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            if current >= self.expected {
                return Err(SyncError::LatchExhausted);
            }
            match self.counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(c) => current = c,
            }
        }
    }

    /// Re-arm for another rendezvous.
    pub fn reset(&mut self) {
        *self.counter.get_mut() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::barrier::GroupBarrier;
    use crate::core::spin::SpinBudget;

    struct SoloLane {
        barrier: GroupBarrier,
        local: usize,
    }

    impl SoloLane {
        fn new(local: usize) -> Self {
            Self {
                barrier: GroupBarrier::new(1),
                local,
            }
        }
    }

    impl GroupContext for SoloLane {
        fn local_linear_id(&self) -> usize {
            self.local
        }

        fn group_linear_id(&self) -> usize {
            0
        }

        fn group_barrier(&self) -> Result<(), SyncError> {
            self.barrier.wait(self.spin_budget(), None).map(|_| ())
        }

        fn spin_budget(&self) -> SpinBudget {
            SpinBudget::bounded(1000)
        }
    }

    #[test]
    fn test_single_group_passes() {
        let latch = GroupLatch::new(1);
        let lane = SoloLane::new(0);

        latch.arrive_and_wait(&lane).unwrap();
        assert!(latch.is_released());
        assert_eq!(latch.arrived(), 1);
    }

    #[test]
    fn test_reuse_without_reset_is_rejected() {
        let mut latch = GroupLatch::new(1);
        let lane = SoloLane::new(0);

        latch.arrive_and_wait(&lane).unwrap();
        assert_eq!(latch.arrive_and_wait(&lane), Err(SyncError::LatchExhausted));
        assert_eq!(latch.arrived(), 1);

        latch.reset();
        assert!(!latch.is_released());
        latch.arrive_and_wait(&lane).unwrap();
    }

    #[test]
    fn test_late_arrival_does_not_strand_waiters() {
        let latch = GroupLatch::new(1);
        latch.arrive_and_wait(&SoloLane::new(0)).unwrap();
        assert_eq!(
            latch.arrive_and_wait(&SoloLane::new(0)),
            Err(SyncError::LatchExhausted)
        );

        // A lane that only waits still sees the released count.
        assert_eq!(latch.arrived(), latch.expected());
        latch.arrive_and_wait(&SoloLane::new(3)).unwrap();
    }

    #[test]
    fn test_missing_group_times_out() {
        let latch = GroupLatch::new(2);
        let lane = SoloLane::new(0);

        assert_eq!(latch.arrive_and_wait(&lane), Err(SyncError::SpinLimitExceeded));
        assert_eq!(latch.arrived(), 1);
    }
}
