//! Device-side core. Nothing in here allocates, blocks, or logs.

pub mod accumulator;
pub mod barrier;
pub mod latch;
pub mod metrics;
pub mod mutex;
pub mod processor;
pub mod ring;
pub mod spin;
pub mod task;

pub use accumulator::{AtomicF64, DependencyAccumulator, DependencyError, NodeCell, NodeSnapshot};
pub use barrier::{GroupBarrier, GroupContext};
pub use latch::GroupLatch;
pub use metrics::{LatencyHistogram, LaunchMetrics, SchedulerMetrics};
pub use mutex::{RawSpinLock, SpinGuard, SpinMutex};
pub use processor::{DispatchError, Operators, Processor, UnitOperators};
pub use ring::{CachePadded, Consumer, Producer, QueueError, RingQueue, SlotValue};
pub use spin::{SpinBudget, SyncError};
pub use task::{BoxId, OperatorKind, Routine, Successors, Task, TaskState, MAX_LEVEL};
