//! Cooperative octree traversal on the simulated device.
//!
//! Each work-group owns one ring queue. Lane 0 holds the producer handle and a
//! private backlog, and every round looks like this:
//!
//! 1. lane 0 moves up to `min(group_size, capacity)` tasks from the backlog
//!    into the queue;
//! 2. group barrier;
//! 3. lane `i < size` runs `front(i)` and writes what it unlocked into its
//!    mailbox row;
//! 4. group barrier;
//! 5. lane 0 collects the mailbox rows into the backlog and pops the round.
//!
//! A task is emitted only by the lane that drove its input counter to zero,
//! and that lane's group runs it. Every counter hits zero once, so every task
//! is queued exactly once and no group ever waits on another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::core::metrics::SchedulerSnapshot;
use crate::core::{
    BoxId, DependencyAccumulator, DependencyError, DispatchError, NodeCell, NodeSnapshot,
    OperatorKind, Operators, Processor, QueueError, RingQueue, SchedulerMetrics, SlotValue, Task,
    TaskState, MAX_LEVEL,
};
use crate::device::{
    Device, DeviceHeap, Item, KernelError, LaunchError, LaunchReport, NdRange, Region,
    RegionError,
};

/// Slots in each group's queue.
pub const QUEUE_CAPACITY: usize = 256;

/// Task words per lane mailbox row. One execution unlocks at most this many.
pub const MAILBOX_WIDTH: usize = crate::core::task::MAX_SUCCESSORS;

pub type TaskQueue = RingQueue<Task, QUEUE_CAPACITY>;

/// Shape of one traversal launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalPlan {
    /// Level of the leaves.
    pub depth: u8,
    pub groups: usize,
    pub group_size: usize,
}

impl Default for TraversalPlan {
    fn default() -> Self {
        Self {
            depth: 3,
            groups: 4,
            group_size: 32,
        }
    }
}

impl TraversalPlan {
    pub fn with_depth(mut self, depth: u8) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    #[inline(always)]
    pub fn range(&self) -> NdRange {
        NdRange::groups_of(self.groups, self.group_size)
    }

    /// Tasks moved into the queue per round.
    #[inline(always)]
    pub fn fill_limit(&self) -> usize {
        self.group_size.min(QUEUE_CAPACITY)
    }
}

/// Tasks a complete traversal executes with leaves at `depth`.
pub const fn expected_tasks(depth: u8) -> u64 {
    let leaves = BoxId::boxes_at(depth) as u64;
    let nodes = BoxId::node_count(depth) as u64;
    let internal = nodes - leaves;
    // P2P + P2M, M2M, M2L, L2L, L2P
    2 * leaves + (nodes - 1) + nodes + internal + leaves
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalError {
    Dependency(DependencyError),
    Region(RegionError),
    Launch(LaunchError),
}

impl From<DependencyError> for TraversalError {
    fn from(e: DependencyError) -> Self {
        TraversalError::Dependency(e)
    }
}

impl From<RegionError> for TraversalError {
    fn from(e: RegionError) -> Self {
        TraversalError::Region(e)
    }
}

impl From<LaunchError> for TraversalError {
    fn from(e: LaunchError) -> Self {
        TraversalError::Launch(e)
    }
}

#[derive(Debug, Clone)]
pub struct TraversalReport {
    pub depth: u8,
    pub executed: u64,
    pub expected: u64,
    /// Level-major, indexed by `BoxId::linear`.
    pub nodes: Vec<NodeSnapshot>,
    pub violation: Option<BoxId>,
    pub launch: LaunchReport,
    pub scheduler: SchedulerSnapshot,
}

impl TraversalReport {
    pub fn node(&self, node: BoxId) -> Option<&NodeSnapshot> {
        if node.level() > self.depth {
            return None;
        }
        self.nodes.get(node.linear())
    }

    /// Every task ran and every counter drained.
    pub fn is_complete(&self) -> bool {
        self.executed == self.expected
            && self.violation.is_none()
            && self
                .nodes
                .iter()
                .all(|n| n.up_pending == 0 && n.down_pending == 0)
    }
}

/// Run a full up and down pass with fresh metrics.
pub fn run_traversal<O: Operators + ?Sized>(
    device: &Device,
    heap: &mut DeviceHeap,
    plan: TraversalPlan,
    ops: &O,
) -> Result<TraversalReport, TraversalError> {
    let metrics = SchedulerMetrics::new();
    run_traversal_with_metrics(device, heap, plan, ops, &metrics)
}

/// Run a full up and down pass, counting into `metrics`.
pub fn run_traversal_with_metrics<O: Operators + ?Sized>(
    device: &Device,
    heap: &mut DeviceHeap,
    plan: TraversalPlan,
    ops: &O,
    metrics: &SchedulerMetrics,
) -> Result<TraversalReport, TraversalError> {
    if plan.depth > MAX_LEVEL {
        return Err(DependencyError::DepthTooLarge.into());
    }
    let range = plan.range();
    range.validate(device.config())?;

    let completed_before = metrics.tasks_in(TaskState::Complete);
    let node_count = BoxId::node_count(plan.depth);
    let cells = heap.alloc_array(node_count, |_| NodeCell::new())?;
    let queues = match heap.alloc_array(plan.groups, |_| TaskQueue::new()) {
        Ok(region) => region,
        Err(e) => {
            heap.free(cells)?;
            return Err(e.into());
        }
    };
    let mailboxes = match heap.alloc_array(range.lane_count() * MAILBOX_WIDTH, |_| {
        AtomicU64::new(Task::VACANT.into_word())
    }) {
        Ok(region) => region,
        Err(e) => {
            heap.free(queues)?;
            heap.free(cells)?;
            return Err(e.into());
        }
    };

    debug!(
        depth = plan.depth,
        groups = plan.groups,
        group_size = plan.group_size,
        nodes = node_count,
        "traversal start"
    );

    let outcome = {
        let heap: &DeviceHeap = heap;
        launch_traversal(device, heap, plan, ops, metrics, cells, queues, mailboxes)
    };

    heap.free(mailboxes)?;
    heap.free(queues)?;
    heap.free(cells)?;

    let (launch, nodes, violation) = outcome?;
    let scheduler = metrics.snapshot();
    let report = TraversalReport {
        depth: plan.depth,
        executed: scheduler.completed - completed_before,
        expected: expected_tasks(plan.depth),
        nodes,
        violation,
        launch,
        scheduler,
    };
    debug!(
        executed = report.executed,
        expected = report.expected,
        rounds = scheduler.rounds,
        "traversal complete"
    );
    Ok(report)
}

type Readback = (LaunchReport, Vec<NodeSnapshot>, Option<BoxId>);

#[allow(clippy::too_many_arguments)]
fn launch_traversal<O: Operators + ?Sized>(
    device: &Device,
    heap: &DeviceHeap,
    plan: TraversalPlan,
    ops: &O,
    metrics: &SchedulerMetrics,
    cells: Region<Vec<NodeCell>>,
    queues: Region<Vec<TaskQueue>>,
    mailboxes: Region<Vec<AtomicU64>>,
) -> Result<Readback, TraversalError> {
    let acc = DependencyAccumulator::new(plan.depth, heap.get(cells)?.as_slice())?;
    let queues = heap.get(queues)?.as_slice();
    let mailboxes = heap.get(mailboxes)?.as_slice();
    let processor = Processor::new(ops, &acc);

    let launched = device.launch(plan.range(), |item| {
        run_lane(item, &plan, &processor, queues, mailboxes, metrics)
    });

    let violation = acc.violation();
    let launch = match launched {
        Ok(report) => report,
        Err(error) => {
            warn!(?error, ?violation, "traversal aborted");
            return Err(error.into());
        }
    };
    let nodes = acc.cells().iter().map(NodeCell::snapshot).collect();
    Ok((launch, nodes, violation))
}

/// Leaves `[start, end)` owned by `group` for seeding.
#[inline]
fn leaf_share(depth: u8, group: usize, groups: usize) -> (u32, u32) {
    let leaves = BoxId::boxes_at(depth) as u64;
    let start = leaves * group as u64 / groups as u64;
    let end = leaves * (group as u64 + 1) / groups as u64;
    (start as u32, end as u32)
}

fn seed(backlog: &mut VecDeque<Task>, depth: u8, group: usize, groups: usize) {
    let (start, end) = leaf_share(depth, group, groups);
    for index in start..end {
        let Some(leaf) = BoxId::new(depth, index) else {
            continue;
        };
        backlog.push_back(Task::new(OperatorKind::ParticleToMultipole, leaf));
        backlog.push_back(Task::new(OperatorKind::ParticleToParticle, leaf));
    }
}

fn run_lane<O, S>(
    item: &Item<'_>,
    plan: &TraversalPlan,
    processor: &Processor<'_, O, S>,
    queues: &[TaskQueue],
    mailboxes: &[AtomicU64],
    metrics: &SchedulerMetrics,
) -> Result<(), KernelError>
where
    O: Operators + ?Sized,
    S: AsRef<[NodeCell]>,
{
    let group = item.group_linear_id();
    let lane = item.local_linear_id();
    let group_size = item.group_size();
    let queue = queues.get(group).ok_or(RegionError::InvalidRegion)?;
    let consumer = queue.consumer();

    let group_rows = mailboxes
        .get(group * group_size * MAILBOX_WIDTH..(group + 1) * group_size * MAILBOX_WIDTH)
        .ok_or(RegionError::InvalidRegion)?;
    let row = &group_rows[lane * MAILBOX_WIDTH..(lane + 1) * MAILBOX_WIDTH];

    let producer = if lane == 0 {
        Some(queue.producer()?)
    } else {
        None
    };
    let mut backlog = VecDeque::new();
    if producer.is_some() {
        seed(&mut backlog, plan.depth, group, item.group_count());
        metrics.record_state(TaskState::Queued, backlog.len() as u64);
    }
    let fill_limit = plan.fill_limit();

    loop {
        if let Some(producer) = &producer {
            while producer.len() < fill_limit {
                let Some(task) = backlog.pop_front() else {
                    break;
                };
                if let Err(e) = producer.push(task) {
                    metrics.record_push(false);
                    return Err(e.into());
                }
                metrics.record_push(true);
            }
        }
        item.barrier()?;

        let size = consumer.len();
        if size == 0 {
            break;
        }
        if lane < size {
            let task = consumer.front(lane).ok_or(QueueError::Underflow)?;
            metrics.record_state(TaskState::Dispatched, 1);
            let next = processor.execute(task).map_err(|e| {
                if matches!(
                    e,
                    DispatchError::Dependency(DependencyError::DoubleCompletion { .. })
                ) {
                    metrics.record_violation();
                }
                e
            })?;
            if let Some(op) = task.operator() {
                metrics.record_complete(op);
            }
            for (slot, task) in row.iter().zip(next.iter()) {
                slot.store(task.into_word(), Ordering::Relaxed);
            }
        }
        item.barrier()?;

        if let Some(producer) = &producer {
            metrics.record_round();
            for lane_row in group_rows.chunks(MAILBOX_WIDTH).take(size) {
                for slot in lane_row {
                    let task = Task::from_word(slot.swap(Task::VACANT.into_word(), Ordering::Relaxed));
                    if task.is_vacant() {
                        break;
                    }
                    backlog.push_back(task);
                    metrics.record_state(TaskState::Queued, 1);
                }
            }
            producer.pop_n(size)?;
            metrics.record_pop(size as u64);
        }
    }
    Ok(())
}
