use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use cloudmirror_core::CloudPath;
use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::EngineError;
use crate::lock::WorkflowDependency;

/// Which execution pool a workflow draws its slot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowConstraint {
    UploadConstrained,
    DownloadConstrained,
    Unconstrained,
}

/// A task paired with its lock plan and execution constraint. The task
/// future is lazy and only starts once the scheduler admits it.
pub struct Workflow<T> {
    pub name: &'static str,
    pub target: CloudPath,
    pub dependency: WorkflowDependency,
    pub constraint: WorkflowConstraint,
    pub task: BoxFuture<'static, Result<T, EngineError>>,
}

#[derive(Clone)]
pub struct WorkflowScheduler {
    upload_limit: Arc<Semaphore>,
    download_limit: Arc<Semaphore>,
}

impl Default for WorkflowScheduler {
    fn default() -> Self {
        let config = SyncConfig::default();
        Self::new(config.max_parallel_uploads, config.max_parallel_downloads)
    }
}

impl WorkflowScheduler {
    pub fn new(max_parallel_uploads: usize, max_parallel_downloads: usize) -> Self {
        Self {
            upload_limit: Arc::new(Semaphore::new(max_parallel_uploads.max(1))),
            download_limit: Arc::new(Semaphore::new(max_parallel_downloads.max(1))),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_parallel_uploads, config.max_parallel_downloads)
    }

    pub fn available_upload_slots(&self) -> usize {
        self.upload_limit.available_permits()
    }

    pub fn available_download_slots(&self) -> usize {
        self.download_limit.available_permits()
    }

    async fn slot(
        &self,
        constraint: WorkflowConstraint,
    ) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        let limit = match constraint {
            WorkflowConstraint::UploadConstrained => &self.upload_limit,
            WorkflowConstraint::DownloadConstrained => &self.download_limit,
            WorkflowConstraint::Unconstrained => return Ok(None),
        };
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::SchedulerClosed)?;
        Ok(Some(permit))
    }

    /// Waits for every lock of the workflow, then for an execution slot, then
    /// runs the task. The slot and then the locks are released on every
    /// outcome, including cancellation of this future.
    pub async fn schedule<T>(&self, workflow: Workflow<T>) -> Result<T, EngineError> {
        let Workflow {
            name,
            target,
            dependency,
            constraint,
            task,
        } = workflow;

        let locks = dependency.await_preconditions().await?;
        debug!(workflow = name, path = %target, "locks granted");
        let slot = self.slot(constraint).await?;

        info!(workflow = name, path = %target, "workflow started");
        let result = task.await;
        drop(slot);
        locks.release();

        match &result {
            Ok(_) => info!(workflow = name, path = %target, "workflow finished"),
            Err(err) => warn!(workflow = name, path = %target, error = %err, "workflow failed"),
        }
        result
    }

    /// Runs [`Self::schedule`] on its own tokio task. Dropping the returned
    /// handle detaches the workflow; it still runs to completion.
    pub fn spawn<T: Send + 'static>(&self, workflow: Workflow<T>) -> ScheduledWorkflow<T> {
        let scheduler = self.clone();
        ScheduledWorkflow {
            handle: tokio::spawn(async move { scheduler.schedule(workflow).await }),
        }
    }
}

pub struct ScheduledWorkflow<T> {
    handle: JoinHandle<Result<T, EngineError>>,
}

impl<T> ScheduledWorkflow<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for ScheduledWorkflow<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) => {
                warn!(error = %err, "workflow task did not complete");
                Poll::Ready(Err(EngineError::WorkflowAborted))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
