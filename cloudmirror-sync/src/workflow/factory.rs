use cloudmirror_core::{CloudPath, ItemType};
use futures_util::future::BoxFuture;
use tracing::debug;

use super::executor::{MetadataPage, TaskExecutor, UploadOutcome};
use super::scheduler::{Workflow, WorkflowConstraint, WorkflowScheduler};
use crate::error::EngineError;
use crate::lock::{DependencyFactory, LockMode};
use crate::store::{ItemMetadata, LocalCachedFileInfo, TaskDetails, TaskKind, TaskRecord};

pub fn lock_mode(kind: TaskKind) -> LockMode {
    match kind {
        TaskKind::Enumeration | TaskKind::Download => LockMode::Read,
        TaskKind::Upload | TaskKind::Deletion | TaskKind::Reparent => LockMode::Write,
    }
}

pub fn constraint(kind: TaskKind, item_type: ItemType) -> WorkflowConstraint {
    match (kind, item_type) {
        (TaskKind::Upload, ItemType::File) => WorkflowConstraint::UploadConstrained,
        (TaskKind::Download, _) => WorkflowConstraint::DownloadConstrained,
        _ => WorkflowConstraint::Unconstrained,
    }
}

/// Builds workflows from task records: the lock request is queued when the
/// workflow is built, so build order is admission order on shared paths.
#[derive(Clone)]
pub struct WorkflowFactory {
    dependencies: DependencyFactory,
    executor: TaskExecutor,
    scheduler: WorkflowScheduler,
}

impl WorkflowFactory {
    pub fn new(
        dependencies: DependencyFactory,
        executor: TaskExecutor,
        scheduler: WorkflowScheduler,
    ) -> Self {
        Self {
            dependencies,
            executor,
            scheduler,
        }
    }

    pub fn dependencies(&self) -> &DependencyFactory {
        &self.dependencies
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        &self.scheduler
    }

    fn workflow<T>(
        &self,
        name: &'static str,
        record: &TaskRecord,
        paths: &[CloudPath],
        item_type: ItemType,
        task: BoxFuture<'static, Result<T, EngineError>>,
    ) -> Workflow<T> {
        let kind = record.kind();
        debug!(workflow = name, path = %record.target_path, "workflow requested");
        Workflow {
            name,
            target: record.target_path.clone(),
            dependency: self.dependencies.create_dependencies(paths, lock_mode(kind)),
            constraint: constraint(kind, item_type),
            task,
        }
    }

    pub fn enumeration_workflow(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> Workflow<MetadataPage> {
        let paths = [item.path.clone()];
        let item_type = item.item_type;
        let executor = self.executor.clone();
        let task = {
            let record = record.clone();
            Box::pin(async move { executor.enumerate(item, record).await })
        };
        self.workflow("enumerate", &record, &paths, item_type, task)
    }

    pub fn download_workflow(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> Workflow<LocalCachedFileInfo> {
        let paths = [item.path.clone()];
        let item_type = item.item_type;
        let executor = self.executor.clone();
        let task = {
            let record = record.clone();
            Box::pin(async move { executor.download(item, record).await })
        };
        self.workflow("download", &record, &paths, item_type, task)
    }

    /// Upload of a file or creation of a folder. When the remote name turns
    /// out to be taken, the placeholder is renamed and a follow-up upload is
    /// spawned; this workflow then resolves to the renamed item.
    pub fn upload_workflow(&self, item: ItemMetadata, record: TaskRecord) -> Workflow<ItemMetadata> {
        let paths = [item.path.clone()];
        let item_type = item.item_type;
        let name = match item_type {
            ItemType::File => "upload",
            ItemType::Folder => "create_folder",
        };
        let factory = self.clone();
        let task = {
            let record = record.clone();
            Box::pin(async move {
                match factory.executor.upload(item, record).await? {
                    UploadOutcome::Uploaded(uploaded) => Ok(uploaded),
                    UploadOutcome::Relocated(moved, record) => {
                        let retry = factory.upload_workflow(moved.clone(), record);
                        drop(factory.scheduler.spawn(retry));
                        Ok(moved)
                    }
                }
            })
        };
        self.workflow(name, &record, &paths, item_type, task)
    }

    pub fn deletion_workflow(&self, record: TaskRecord) -> Workflow<()> {
        let (paths, item_type) = match &record.details {
            TaskDetails::Deletion {
                subtree_path,
                item_type,
                ..
            } => ([subtree_path.clone()], *item_type),
            _ => ([record.target_path.clone()], ItemType::File),
        };
        let executor = self.executor.clone();
        let task = {
            let record = record.clone();
            Box::pin(async move { executor.delete(record).await })
        };
        self.workflow("delete", &record, &paths, item_type, task)
    }

    /// Locks both the old and the new path of the item.
    pub fn reparent_workflow(&self, item_type: ItemType, record: TaskRecord) -> Workflow<()> {
        let mut paths = vec![record.target_path.clone()];
        if let TaskDetails::Reparent { source_path, .. } = &record.details {
            paths.push(source_path.clone());
        }
        let executor = self.executor.clone();
        let task = {
            let record = record.clone();
            Box::pin(async move { executor.reparent(record).await })
        };
        self.workflow("reparent", &record, &paths, item_type, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_for_listing_and_download_writes_for_changes() {
        assert_eq!(lock_mode(TaskKind::Enumeration), LockMode::Read);
        assert_eq!(lock_mode(TaskKind::Download), LockMode::Read);
        assert_eq!(lock_mode(TaskKind::Upload), LockMode::Write);
        assert_eq!(lock_mode(TaskKind::Deletion), LockMode::Write);
        assert_eq!(lock_mode(TaskKind::Reparent), LockMode::Write);
    }

    #[test]
    fn only_file_transfers_are_constrained() {
        assert_eq!(
            constraint(TaskKind::Upload, ItemType::File),
            WorkflowConstraint::UploadConstrained
        );
        assert_eq!(
            constraint(TaskKind::Upload, ItemType::Folder),
            WorkflowConstraint::Unconstrained
        );
        assert_eq!(
            constraint(TaskKind::Download, ItemType::File),
            WorkflowConstraint::DownloadConstrained
        );
        for kind in [TaskKind::Enumeration, TaskKind::Deletion, TaskKind::Reparent] {
            assert_eq!(constraint(kind, ItemType::File), WorkflowConstraint::Unconstrained);
        }
    }
}
