//! Launch and scheduler metrics. Atomics only, safe to share with every lane.

use core::sync::atomic::{AtomicU64, Ordering};

use super::task::{OperatorKind, TaskState};

#[cfg(feature = "std")]
pub mod prometheus;

#[cfg(feature = "std")]
pub use prometheus::PrometheusExporter;

/// 64 power-of-two buckets: bucket[i] counts samples < 2^(i+3) ns, bucket 63 is overflow.
#[repr(C, align(64))]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 64],
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; 64],
        }
    }

    #[inline(always)]
    pub fn record(&self, latency_ns: u64) {
        self.buckets[Self::bucket_for(latency_ns)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub const fn bucket_for(latency_ns: u64) -> usize {
        if latency_ns < 8 {
            return 0;
        }
        let idx = 64 - latency_ns.leading_zeros() as usize - 3;
        if idx > 63 {
            63
        } else {
            idx
        }
    }

    /// Exclusive upper bound of a bucket. Saturates at the top.
    #[inline(always)]
    pub const fn bucket_le(bucket: usize) -> u64 {
        if bucket >= 61 {
            u64::MAX
        } else {
            1u64 << (bucket + 3)
        }
    }

    #[inline(always)]
    pub fn bucket_count(&self, bucket: usize) -> u64 {
        self.buckets[bucket.min(63)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    pub fn snapshot(&self) -> [u64; 64] {
        core::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    /// Bucket bound at which `pct` percent of samples are covered.
    pub fn percentile(&self, pct: u8) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let target = (total as u128 * pct.min(100) as u128 / 100) as u64;
        let mut cumulative = 0u64;
        for i in 0..64 {
            cumulative += self.bucket_count(i);
            if cumulative >= target {
                return Self::bucket_le(i);
            }
        }
        Self::bucket_le(63)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
fn update_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value > current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(c) => current = c,
        }
    }
}

/// Kernel launches as seen by the host. Monotonic.
#[derive(Default)]
pub struct LaunchMetrics {
    pub launches: AtomicU64,
    pub lanes: AtomicU64,
    pub failures: AtomicU64,
    pub aborted_lanes: AtomicU64,
    pub total_latency_ns: AtomicU64,
    pub max_latency_ns: AtomicU64,
    pub latency: LatencyHistogram,
}

impl LaunchMetrics {
    pub const fn new() -> Self {
        Self {
            launches: AtomicU64::new(0),
            lanes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            aborted_lanes: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            max_latency_ns: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    #[inline]
    pub fn record_launch(&self, lanes: u64, latency_ns: u64) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        self.lanes.fetch_add(lanes, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        update_max(&self.max_latency_ns, latency_ns);
        self.latency.record(latency_ns);
    }

    #[inline(always)]
    pub fn record_failure(&self, aborted_lanes: u64) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.aborted_lanes.fetch_add(aborted_lanes, Ordering::Relaxed);
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ns(&self) -> u64 {
        let launches = self.launches();
        if launches == 0 {
            0
        } else {
            self.total_latency_ns.load(Ordering::Relaxed) / launches
        }
    }

    pub fn snapshot(&self) -> LaunchSnapshot {
        LaunchSnapshot {
            launches: self.launches(),
            lanes: self.lanes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            aborted_lanes: self.aborted_lanes.load(Ordering::Relaxed),
            avg_latency_ns: self.avg_latency_ns(),
            max_latency_ns: self.max_latency_ns.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for LaunchMetrics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LaunchMetrics")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchSnapshot {
    pub launches: u64,
    pub lanes: u64,
    pub failures: u64,
    pub aborted_lanes: u64,
    pub avg_latency_ns: u64,
    pub max_latency_ns: u64,
}

/// Queue traffic and task lifecycle, shared by every lane of a traversal.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    states: [AtomicU64; 3],
    executed: [AtomicU64; 6],
    pub pushes: AtomicU64,
    pub rejected_pushes: AtomicU64,
    pub pops: AtomicU64,
    pub rounds: AtomicU64,
    pub dependency_violations: AtomicU64,
}

impl SchedulerMetrics {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            states: [ZERO; 3],
            executed: [ZERO; 6],
            pushes: ZERO,
            rejected_pushes: ZERO,
            pops: ZERO,
            rounds: ZERO,
            dependency_violations: ZERO,
        }
    }

    #[inline(always)]
    pub fn record_state(&self, state: TaskState, count: u64) {
        self.states[state as usize].fetch_add(count, Ordering::Relaxed);
    }

    /// One task finished: counted as complete and by operator.
    #[inline(always)]
    pub fn record_complete(&self, op: OperatorKind) {
        self.states[TaskState::Complete as usize].fetch_add(1, Ordering::Relaxed);
        self.executed[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_push(&self, accepted: bool) {
        if accepted {
            self.pushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected_pushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn record_pop(&self, count: u64) {
        self.pops.fetch_add(count, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_violation(&self) {
        self.dependency_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn tasks_in(&self, state: TaskState) -> u64 {
        self.states[state as usize].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn executed(&self, op: OperatorKind) -> u64 {
        self.executed[op as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queued: self.tasks_in(TaskState::Queued),
            dispatched: self.tasks_in(TaskState::Dispatched),
            completed: self.tasks_in(TaskState::Complete),
            executed: core::array::from_fn(|i| self.executed[i].load(Ordering::Relaxed)),
            pushes: self.pushes.load(Ordering::Relaxed),
            rejected_pushes: self.rejected_pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            dependency_violations: self.dependency_violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerSnapshot {
    pub queued: u64,
    pub dispatched: u64,
    pub completed: u64,
    /// Indexed by `OperatorKind as usize`.
    pub executed: [u64; 6],
    pub pushes: u64,
    pub rejected_pushes: u64,
    pub pops: u64,
    pub rounds: u64,
    pub dependency_violations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bucket_assignment() {
        assert_eq!(LatencyHistogram::bucket_for(0), 0);
        assert_eq!(LatencyHistogram::bucket_for(7), 0);
        assert_eq!(LatencyHistogram::bucket_for(8), 1);
        assert_eq!(LatencyHistogram::bucket_for(16), 2);
        assert_eq!(LatencyHistogram::bucket_for(1000), 7);
        assert_eq!(LatencyHistogram::bucket_for(u64::MAX), 61);
    }

    #[test]
    fn test_histogram_percentile() {
        let h = LatencyHistogram::new();
        for _ in 0..90 {
            h.record(100);
        }
        for _ in 0..10 {
            h.record(5000);
        }
        assert_eq!(h.total(), 100);
        assert_eq!(h.percentile(50), 128);
        assert_eq!(h.percentile(99), 8192);
    }

    #[test]
    fn test_launch_metrics() {
        let m = LaunchMetrics::new();
        m.record_launch(64, 1000);
        m.record_launch(32, 3000);
        m.record_failure(31);

        let snap = m.snapshot();
        assert_eq!(snap.launches, 2);
        assert_eq!(snap.lanes, 96);
        assert_eq!(snap.avg_latency_ns, 2000);
        assert_eq!(snap.max_latency_ns, 3000);
        assert_eq!(snap.failures, 1);
        assert_eq!(m.latency.total(), 2);
    }

    #[test]
    fn test_scheduler_lifecycle_counts() {
        let m = SchedulerMetrics::new();
        m.record_state(TaskState::Queued, 3);
        m.record_state(TaskState::Dispatched, 2);
        m.record_complete(OperatorKind::MultipoleToLocal);
        m.record_complete(OperatorKind::MultipoleToLocal);
        m.record_push(true);
        m.record_push(false);

        let snap = m.snapshot();
        assert_eq!((snap.queued, snap.dispatched, snap.completed), (3, 2, 2));
        assert_eq!(snap.executed[OperatorKind::MultipoleToLocal as usize], 2);
        assert_eq!((snap.pushes, snap.rejected_pushes), (1, 1));
    }
}
