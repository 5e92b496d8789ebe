use cloudmirror_core::{CloudPath, PathError, ProviderError};
use thiserror::Error;

use crate::lock::LockError;
use crate::store::{FailureKind, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("item not found: {0}")]
    ItemNotFound(i64),
    #[error("item {0} is not a folder")]
    ParentNotFolder(i64),
    #[error("item {0} is not a file")]
    NotAFile(i64),
    #[error("cannot move {0} into its own subtree")]
    MoveIntoOwnSubtree(CloudPath),
    #[error("no free name for {0}")]
    NameCollision(CloudPath),
    #[error("remote returned inconsistent metadata for {0}")]
    InconsistentItem(CloudPath),
    #[error("item {0} has no cached file")]
    MissingCachedFile(i64),
    #[error("item {0} has not been uploaded yet")]
    PendingUpload(i64),
    #[error("item {0} has no pending upload")]
    NoPendingUpload(i64),
    #[error("the root folder cannot be changed")]
    RootItem,
    #[error("workflow concurrency limiter is closed")]
    SchedulerClosed,
    #[error("workflow task was aborted")]
    WorkflowAborted,
}

impl EngineError {
    /// Failure code persisted on the task record when this error ends a
    /// workflow.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Provider(err) => FailureKind::from(err),
            EngineError::Io(_) | EngineError::MissingCachedFile(_) => FailureKind::LocalIo,
            EngineError::Store(StoreError::Io(_)) => FailureKind::LocalIo,
            EngineError::InconsistentItem(_) => FailureKind::InconsistentItem,
            EngineError::ItemNotFound(_) | EngineError::Store(StoreError::MissingPath(_)) => {
                FailureKind::NotFound
            },
            EngineError::NameCollision(_) => FailureKind::AlreadyExists,
            _ => FailureKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Provider(ProviderError::NotFound(_)))
    }

    pub fn is_no_connection(&self) -> bool {
        matches!(self, EngineError::Provider(ProviderError::NoConnection))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, EngineError::Provider(ProviderError::AlreadyExists(_)))
    }
}
