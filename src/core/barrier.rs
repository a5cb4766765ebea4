//! Work-group barrier and the lane view that group primitives need.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::spin::{SpinBudget, SyncError};

/// What a lane exposes to group-level primitives.
pub trait GroupContext {
    fn local_linear_id(&self) -> usize;

    fn group_linear_id(&self) -> usize;

    /// Full-group barrier. Every lane of the group must reach it.
    fn group_barrier(&self) -> Result<(), SyncError>;

    fn spin_budget(&self) -> SpinBudget {
        SpinBudget::UNBOUNDED
    }

    fn abort_flag(&self) -> Option<&AtomicBool> {
        None
    }
}

/// Generation-counting spin barrier. Reusable, abortable.
#[derive(Debug)]
pub struct GroupBarrier {
    participants: u32,
    arrived: AtomicU32,
    generation: AtomicU32,
}

impl GroupBarrier {
    pub const fn new(participants: u32) -> Self {
        Self {
            participants,
            arrived: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub const fn participants(&self) -> u32 {
        self.participants
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Block until all participants arrive. `Ok(true)` for the lane that closed the round.
    #[inline]
    pub fn wait(&self, budget: SpinBudget, abort: Option<&AtomicBool>) -> Result<bool, SyncError> {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.participants {
            // Reset before publishing: next-round arrivals only start after they see the bump.
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return Ok(true);
        }
        budget.spin_until(abort, || self.generation.load(Ordering::Acquire) != generation)?;
        Ok(false)
    }
}
