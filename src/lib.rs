#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod core;

#[cfg(feature = "std")]
pub mod device;

#[cfg(feature = "std")]
pub mod schedule;

/// Prelude for convenient imports of primary API types.
pub mod prelude {
    pub use crate::core::{
        BoxId, DependencyAccumulator, DispatchError, GroupContext, GroupLatch, NodeCell,
        OperatorKind, Operators, Processor, QueueError, RingQueue, SpinBudget, SpinMutex,
        SyncError, Task, UnitOperators,
    };

    #[cfg(feature = "std")]
    pub use crate::device::{
        Device, DeviceConfig, DeviceHeap, Item, KernelError, LaunchError, NdRange, Region,
    };

    #[cfg(feature = "std")]
    pub use crate::schedule::{run_traversal, TraversalPlan, TraversalReport};
}

// Re-export primary types at crate root for convenience.
pub use crate::core::{
    BoxId, DependencyAccumulator, DependencyError, DispatchError, GroupBarrier, GroupContext,
    GroupLatch, NodeCell, OperatorKind, Operators, Processor, QueueError, RingQueue, SpinBudget,
    SpinMutex, SyncError, Task, TaskState, UnitOperators,
};

#[cfg(feature = "std")]
pub use crate::device::{
    Device, DeviceConfig, DeviceHeap, Item, KernelError, LaunchError, LaunchReport, NdRange,
    Region, RegionError,
};

#[cfg(feature = "std")]
pub use crate::schedule::{expected_tasks, run_traversal, TraversalPlan, TraversalReport};
