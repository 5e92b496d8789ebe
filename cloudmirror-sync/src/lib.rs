pub mod config;
pub mod conflict;
pub mod engine;
mod error;
mod item;
pub mod lock;
pub mod paths;
pub mod runtime;
pub mod store;
pub mod workflow;

pub use config::SyncConfig;
pub use engine::{PendingOperation, SyncEngine};
pub use error::EngineError;
pub use item::{ProvidedItem, ProvidedItemList};
pub use lock::{DependencyFactory, LockMode, PathLockGraph};
pub use runtime::SyncRuntime;
pub use store::{Database, ItemMetadata, ItemStatus, StoreError};
pub use workflow::{WorkflowConstraint, WorkflowScheduler};
