use std::collections::BTreeMap;

use cloudmirror_core::CloudPath;

use super::graph::{HeldLocks, LockError, LockMode, LockStep, PathLockGraph, PendingLocks};

/// Merges the lock chains of every path into one plan in global path order.
///
/// Steps on the same path collapse into one, write winning over read. All
/// plans therefore take their locks in the same order, whatever order the
/// caller listed the paths in.
pub fn lock_plan(paths: &[CloudPath], mode: LockMode) -> Vec<LockStep> {
    let mut merged: BTreeMap<CloudPath, LockMode> = BTreeMap::new();
    for path in paths {
        for step in LockStep::chain(path, mode) {
            merged
                .entry(step.path)
                .and_modify(|existing| *existing = (*existing).max(step.mode))
                .or_insert(step.mode);
        }
    }
    merged
        .into_iter()
        .map(|(path, mode)| LockStep { path, mode })
        .collect()
}

/// The combined lock precondition of one workflow.
pub struct WorkflowDependency {
    plan: Vec<LockStep>,
    pending: PendingLocks,
}

impl WorkflowDependency {
    pub fn plan(&self) -> &[LockStep] {
        &self.plan
    }

    /// Resolves once every lock of the plan is held. Dropping the returned
    /// [`HeldLocks`] releases them all.
    pub async fn await_preconditions(self) -> Result<HeldLocks, LockError> {
        self.pending.await
    }
}

#[derive(Clone, Default)]
pub struct DependencyFactory {
    graph: PathLockGraph,
}

impl DependencyFactory {
    pub fn new(graph: PathLockGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &PathLockGraph {
        &self.graph
    }

    /// Queues the first lock of the plan right away; the rest follow as
    /// earlier steps are granted.
    pub fn create_dependencies(&self, paths: &[CloudPath], mode: LockMode) -> WorkflowDependency {
        let plan = lock_plan(paths, mode);
        let pending = self.graph.acquire_plan(plan.clone());
        WorkflowDependency { plan, pending }
    }
}
