pub mod executor;
pub mod factory;
pub mod scheduler;

pub use executor::{MetadataPage, TaskExecutor, UploadOutcome};
pub use factory::WorkflowFactory;
pub use scheduler::{ScheduledWorkflow, Workflow, WorkflowConstraint, WorkflowScheduler};
