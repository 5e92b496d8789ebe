pub mod dependency;
pub mod graph;

pub use dependency::{DependencyFactory, WorkflowDependency, lock_plan};
pub use graph::{
    HeldLocks, LockError, LockMode, LockNodeInfo, LockStep, LockTicket, NodeGuard, PathLockGraph,
    PendingLocks,
};
