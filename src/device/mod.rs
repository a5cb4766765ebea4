//! Host-simulated accelerator.
//!
//! Every lane is an OS thread and every group of a launch is resident at the
//! same time, so cross-group spinning behaves as it does on hardware. Lanes of
//! one group share a spinning [`GroupBarrier`]. The launch owns a single abort
//! flag: the first lane to fail (or panic) raises it and every spinning lane
//! bails out with [`SyncError::Aborted`] instead of hanging the join.

pub mod heap;

pub use heap::{DeviceHeap, Region, RegionError};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::{
    DependencyError, DispatchError, GroupBarrier, GroupContext, LaunchMetrics, QueueError,
    SpinBudget, SyncError,
};

/// Stack reserved per lane thread.
pub const LANE_STACK_BYTES: usize = 256 << 10;

/// Limits of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Largest work-group.
    pub max_group_size: usize,
    /// Largest launch. Every lane is a thread.
    pub max_lanes: usize,
    pub compute_units: usize,
    /// Spin cap for barriers, latches and locks. `None` spins forever.
    pub spin_limit: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::from("host-simulated"),
            max_group_size: 1024,
            max_lanes: 4096,
            compute_units: thread::available_parallelism().map_or(1, |n| n.get()),
            spin_limit: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_group_size(mut self, max_group_size: usize) -> Self {
        self.max_group_size = max_group_size;
        self
    }

    pub fn with_max_lanes(mut self, max_lanes: usize) -> Self {
        self.max_lanes = max_lanes;
        self
    }

    pub fn with_spin_limit(mut self, spin_limit: Option<u64>) -> Self {
        self.spin_limit = spin_limit;
        self
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.name)?;
        writeln!(f, "  max work-group size: {}", self.max_group_size)?;
        writeln!(f, "  max lanes per launch: {}", self.max_lanes)?;
        write!(f, "  compute units: {}", self.compute_units)
    }
}

/// Index space of a launch: 1-D or 2-D, split into equal groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    dims: usize,
    global: [usize; 2],
    local: [usize; 2],
}

impl NdRange {
    pub const fn linear(global: usize, local: usize) -> Self {
        Self {
            dims: 1,
            global: [global, 1],
            local: [local, 1],
        }
    }

    pub const fn planar(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dims: 2,
            global,
            local,
        }
    }

    /// `groups` groups of `group_size` lanes.
    pub const fn groups_of(groups: usize, group_size: usize) -> Self {
        Self::linear(groups * group_size, group_size)
    }

    #[inline(always)]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    #[inline(always)]
    pub const fn global(&self) -> [usize; 2] {
        self.global
    }

    #[inline(always)]
    pub const fn local(&self) -> [usize; 2] {
        self.local
    }

    /// Groups per dimension. Only meaningful once validated.
    #[inline(always)]
    pub const fn groups(&self) -> [usize; 2] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1]]
    }

    #[inline(always)]
    pub const fn group_size(&self) -> usize {
        self.local[0] * self.local[1]
    }

    #[inline(always)]
    pub const fn group_count(&self) -> usize {
        let groups = self.groups();
        groups[0] * groups[1]
    }

    #[inline(always)]
    pub const fn lane_count(&self) -> usize {
        self.global[0] * self.global[1]
    }

    pub fn validate(&self, config: &DeviceConfig) -> Result<(), LaunchError> {
        if self.global.contains(&0) || self.local.contains(&0) {
            return Err(LaunchError::EmptyRange);
        }
        if self.global[0] % self.local[0] != 0 || self.global[1] % self.local[1] != 0 {
            return Err(LaunchError::UnevenRange);
        }
        let size = self.group_size();
        if size > config.max_group_size || size > u32::MAX as usize {
            return Err(LaunchError::GroupTooLarge {
                size,
                max: config.max_group_size,
            });
        }
        let lanes = self.lane_count();
        if lanes > config.max_lanes {
            return Err(LaunchError::TooManyLanes {
                lanes,
                max: config.max_lanes,
            });
        }
        Ok(())
    }
}

/// What a kernel may fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Sync(SyncError),
    Queue(QueueError),
    Dispatch(DispatchError),
    Dependency(DependencyError),
    Region(RegionError),
}

impl KernelError {
    /// Stopped because some other lane failed first.
    #[inline(always)]
    pub fn is_abort(&self) -> bool {
        matches!(self, KernelError::Sync(SyncError::Aborted))
    }
}

impl From<SyncError> for KernelError {
    fn from(e: SyncError) -> Self {
        KernelError::Sync(e)
    }
}

impl From<QueueError> for KernelError {
    fn from(e: QueueError) -> Self {
        KernelError::Queue(e)
    }
}

impl From<DispatchError> for KernelError {
    fn from(e: DispatchError) -> Self {
        KernelError::Dispatch(e)
    }
}

impl From<DependencyError> for KernelError {
    fn from(e: DependencyError) -> Self {
        KernelError::Dependency(e)
    }
}

impl From<RegionError> for KernelError {
    fn from(e: RegionError) -> Self {
        KernelError::Region(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    EmptyRange,
    /// A global size is not a multiple of its local size.
    UnevenRange,
    GroupTooLarge { size: usize, max: usize },
    TooManyLanes { lanes: usize, max: usize },
    /// The OS refused a lane thread. Lanes are named by global linear id.
    SpawnFailed { lane: usize },
    /// Lowest global linear id whose kernel returned an error.
    Kernel { lane: usize, error: KernelError },
    LanePanicked { lane: usize },
}

/// One lane's view of the launch.
#[derive(Debug)]
pub struct Item<'a> {
    range: NdRange,
    global_id: [usize; 2],
    local_id: [usize; 2],
    group_id: [usize; 2],
    barrier: &'a GroupBarrier,
    abort: &'a AtomicBool,
    budget: SpinBudget,
}

impl<'a> Item<'a> {
    fn new(
        range: NdRange,
        group: usize,
        lane: usize,
        barrier: &'a GroupBarrier,
        abort: &'a AtomicBool,
        budget: SpinBudget,
    ) -> Self {
        let groups = range.groups();
        let local = range.local();
        let group_id = [group / groups[1], group % groups[1]];
        let local_id = [lane / local[1], lane % local[1]];
        let global_id = [
            group_id[0] * local[0] + local_id[0],
            group_id[1] * local[1] + local_id[1],
        ];
        Self {
            range,
            global_id,
            local_id,
            group_id,
            barrier,
            abort,
            budget,
        }
    }

    #[inline(always)]
    pub fn range(&self) -> NdRange {
        self.range
    }

    #[inline(always)]
    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id[dim]
    }

    #[inline(always)]
    pub fn local_id(&self, dim: usize) -> usize {
        self.local_id[dim]
    }

    #[inline(always)]
    pub fn group_id(&self, dim: usize) -> usize {
        self.group_id[dim]
    }

    #[inline(always)]
    pub fn global_linear_id(&self) -> usize {
        self.global_id[0] * self.range.global[1] + self.global_id[1]
    }

    #[inline(always)]
    pub fn local_linear_id(&self) -> usize {
        self.local_id[0] * self.range.local[1] + self.local_id[1]
    }

    #[inline(always)]
    pub fn group_linear_id(&self) -> usize {
        self.group_id[0] * self.range.groups()[1] + self.group_id[1]
    }

    #[inline(always)]
    pub fn group_size(&self) -> usize {
        self.range.group_size()
    }

    #[inline(always)]
    pub fn group_count(&self) -> usize {
        self.range.group_count()
    }

    /// Wait for every lane of this group.
    #[inline]
    pub fn barrier(&self) -> Result<(), SyncError> {
        self.barrier.wait(self.budget, Some(self.abort)).map(|_| ())
    }

    /// Stop the whole launch.
    #[inline]
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

impl GroupContext for Item<'_> {
    fn local_linear_id(&self) -> usize {
        Item::local_linear_id(self)
    }

    fn group_linear_id(&self) -> usize {
        Item::group_linear_id(self)
    }

    fn group_barrier(&self) -> Result<(), SyncError> {
        self.barrier()
    }

    fn spin_budget(&self) -> SpinBudget {
        self.budget
    }

    fn abort_flag(&self) -> Option<&AtomicBool> {
        Some(self.abort)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchReport {
    pub lanes: usize,
    pub groups: usize,
    pub group_size: usize,
    pub elapsed: Duration,
}

/// Raises the abort flag if the lane unwinds.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    metrics: Arc<LaunchMetrics>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(LaunchMetrics::new()),
        }
    }

    #[inline(always)]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline(always)]
    pub fn metrics(&self) -> &Arc<LaunchMetrics> {
        &self.metrics
    }

    /// Run `kernel` on every lane of `range` and wait for all of them.
    pub fn launch<K>(&self, range: NdRange, kernel: K) -> Result<LaunchReport, LaunchError>
    where
        K: Fn(&Item<'_>) -> Result<(), KernelError> + Sync,
    {
        range.validate(&self.config)?;
        let groups = range.group_count();
        let group_size = range.group_size();
        let lanes = range.lane_count();
        let budget = SpinBudget::from_limit(self.config.spin_limit);
        let barriers: Vec<GroupBarrier> = (0..groups)
            .map(|_| GroupBarrier::new(group_size as u32))
            .collect();
        let abort = AtomicBool::new(false);

        debug!(device = %self.config.name, groups, group_size, "launch");
        let started = Instant::now();

        let (outcomes, spawn_failure) = thread::scope(|s| {
            let mut handles = Vec::with_capacity(lanes);
            let mut spawn_failure = None;
            'spawn: for (group, barrier) in barriers.iter().enumerate() {
                for lane in 0..group_size {
                    let item = Item::new(range, group, lane, barrier, &abort, budget);
                    let id = item.global_linear_id();
                    let kernel = &kernel;
                    let abort = &abort;
                    let spawned = thread::Builder::new()
                        .name(format!("lane-{group}-{lane}"))
                        .stack_size(LANE_STACK_BYTES)
                        .spawn_scoped(s, move || {
                            let _guard = AbortOnPanic(abort);
                            let result = kernel(&item);
                            if result.is_err() {
                                abort.store(true, Ordering::Release);
                            }
                            result
                        });
                    match spawned {
                        Ok(handle) => handles.push((id, handle)),
                        Err(_) => {
                            abort.store(true, Ordering::Release);
                            spawn_failure = Some(id);
                            break 'spawn;
                        }
                    }
                }
            }
            let mut outcomes: Vec<_> = handles
                .into_iter()
                .map(|(id, h)| (id, h.join()))
                .collect();
            outcomes.sort_unstable_by_key(|(id, _)| *id);
            (outcomes, spawn_failure)
        });

        let elapsed = started.elapsed();
        self.metrics
            .record_launch(lanes as u64, elapsed.as_nanos().min(u64::MAX as u128) as u64);

        let mut failure = spawn_failure.map(|lane| LaunchError::SpawnFailed { lane });
        let mut first_abort = None;
        let mut aborted = 0u64;
        for (lane, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) if error.is_abort() => {
                    aborted += 1;
                    first_abort.get_or_insert(LaunchError::Kernel { lane, error });
                }
                Ok(Err(error)) => {
                    failure.get_or_insert(LaunchError::Kernel { lane, error });
                }
                Err(_) => {
                    failure.get_or_insert(LaunchError::LanePanicked { lane });
                }
            }
        }

        if let Some(error) = failure.or(first_abort) {
            self.metrics.record_failure(aborted);
            warn!(device = %self.config.name, ?error, aborted, "launch failed");
            return Err(error);
        }

        debug!(device = %self.config.name, lanes, ?elapsed, "launch complete");
        Ok(LaunchReport {
            lanes,
            groups,
            group_size,
            elapsed,
        })
    }

    /// One lane, one group.
    pub fn single_task<K>(&self, kernel: K) -> Result<LaunchReport, LaunchError>
    where
        K: Fn(&Item<'_>) -> Result<(), KernelError> + Sync,
    {
        self.launch(NdRange::linear(1, 1), kernel)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_range_validation() {
        let config = DeviceConfig::default().with_max_group_size(64).with_max_lanes(256);

        assert_eq!(NdRange::linear(0, 1).validate(&config), Err(LaunchError::EmptyRange));
        assert_eq!(NdRange::linear(10, 3).validate(&config), Err(LaunchError::UnevenRange));
        assert_eq!(
            NdRange::linear(128, 128).validate(&config),
            Err(LaunchError::GroupTooLarge { size: 128, max: 64 })
        );
        assert_eq!(
            NdRange::planar([32, 16], [4, 4]).validate(&config),
            Err(LaunchError::TooManyLanes { lanes: 512, max: 256 })
        );
        assert!(NdRange::planar([8, 8], [4, 2]).validate(&config).is_ok());
    }

    #[test]
    fn test_ids_cover_range() {
        let device = Device::default();
        let range = NdRange::planar([4, 6], [2, 3]);
        let seen: Vec<AtomicUsize> = (0..24).map(|_| AtomicUsize::new(0)).collect();

        let report = device
            .launch(range, |item| {
                assert!(item.local_linear_id() < 6);
                assert!(item.group_linear_id() < 4);
                assert_eq!(item.global_id(0), item.group_id(0) * 2 + item.local_id(0));
                seen[item.global_linear_id()].fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();

        assert_eq!((report.lanes, report.groups, report.group_size), (24, 4, 6));
        assert!(seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_failing_lane_releases_group() {
        let device = Device::default();
        let result = device.launch(NdRange::linear(8, 8), |item| {
            if item.local_linear_id() == 3 {
                return Err(QueueError::Full.into());
            }
            item.barrier()?;
            Ok(())
        });

        assert_eq!(
            result.err(),
            Some(LaunchError::Kernel {
                lane: 3,
                error: KernelError::Queue(QueueError::Full)
            })
        );
        assert_eq!(device.metrics().snapshot().failures, 1);
    }

    #[test]
    fn test_planar_failure_names_global_lane() {
        let device = Device::default();
        // Lane (1, 0) spawns before lane (0, 2), which has the lower global id.
        let result = device.launch(NdRange::planar([4, 4], [2, 2]), |item| {
            match (item.global_id(0), item.global_id(1)) {
                (0, 2) => Err(QueueError::Full.into()),
                (1, 0) => Err(QueueError::Underflow.into()),
                _ => Ok(()),
            }
        });

        assert_eq!(
            result.err(),
            Some(LaunchError::Kernel {
                lane: 2,
                error: KernelError::Queue(QueueError::Full)
            })
        );
    }

    #[test]
    fn test_panicking_lane_is_reported() {
        let device = Device::default();
        let result = device.launch(NdRange::linear(4, 4), |item| {
            if item.local_linear_id() == 1 {
                panic!("lane down");
            }
            item.barrier()?;
            Ok(())
        });
        assert_eq!(result.err(), Some(LaunchError::LanePanicked { lane: 1 }));
    }

    #[test]
    fn test_spin_limit_surfaces() {
        let device = Device::new(DeviceConfig::default().with_spin_limit(Some(10_000)));
        let flag = AtomicBool::new(false);
        let result = device.single_task(|item| {
            SpinBudget::from_limit(device.config().spin_limit)
                .spin_until(Some(&flag), || item.is_aborted())?;
            Ok(())
        });
        assert_eq!(
            result.err(),
            Some(LaunchError::Kernel {
                lane: 0,
                error: KernelError::Sync(SyncError::SpinLimitExceeded)
            })
        );
    }
}
