use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use cloudmirror_core::{CloudPath, ItemType, PathError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

pub mod cache;
pub mod maintenance;
pub mod metadata;
pub mod tasks;

pub use cache::{CachedFileManager, LocalCachedFileInfo};
pub use maintenance::MaintenanceManager;
pub use metadata::{ItemMetadata, ItemStatus, MetadataStore, NewItem, ROOT_ITEM_ID};
pub use tasks::{
    DeletionTaskManager, DownloadTaskManager, EnumerationTaskManager, FailureKind,
    ReparentTaskManager, TaskDetails, TaskKind, TaskRecord, TaskStore, UploadTaskManager,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored path is invalid: {0}")]
    Path(#[from] PathError),
    #[error("invalid item type: {0}")]
    InvalidItemType(String),
    #[error("invalid item status: {0}")]
    InvalidStatus(String),
    #[error("invalid task kind: {0}")]
    InvalidTaskKind(String),
    #[error("invalid failure kind: {0}")]
    InvalidFailureKind(String),
    #[error("task record is missing {0}")]
    IncompleteTask(&'static str),
    #[error("item not found: {0}")]
    MissingItem(i64),
    #[error("no item at path {0}")]
    MissingPath(CloudPath),
    #[error("{kind} task already exists for item {item_id}")]
    TaskExists { item_id: i64, kind: TaskKind },
    #[error("cached file of item {0} has unsynced edits")]
    FileHasUnsyncedEdits(i64),
    #[error("maintenance mode is enabled, no new tasks are accepted")]
    MaintenanceMode,
    #[error("tasks are running or pending")]
    RunningTask,
}

// Messages raised by the maintenance triggers of the schema.
const MAINTENANCE_MODE_ABORT: &str = "maintenance mode";
const RUNNING_TASK_ABORT: &str = "running task";

impl StoreError {
    /// Maps trigger aborts of a write onto their variants.
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.message() {
                MAINTENANCE_MODE_ABORT => return StoreError::MaintenanceMode,
                RUNNING_TASK_ABORT => return StoreError::RunningTask,
                _ => {}
            }
        }
        StoreError::Sqlx(err)
    }
}

/// Shared SQLite pool with the schema applied.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Every store the engine works with, sharing one database.
#[derive(Clone)]
pub struct Stores {
    pub tasks: TaskStore,
    pub metadata: MetadataStore,
    pub cache: CachedFileManager,
    pub maintenance: MaintenanceManager,
    pub uploads: UploadTaskManager,
    pub downloads: DownloadTaskManager,
    pub enumerations: EnumerationTaskManager,
    pub deletions: DeletionTaskManager,
    pub reparents: ReparentTaskManager,
}

impl Stores {
    pub fn new(db: &Database) -> Self {
        let tasks = TaskStore::new(db);
        Self {
            tasks: tasks.clone(),
            metadata: MetadataStore::new(db),
            cache: CachedFileManager::new(db),
            maintenance: MaintenanceManager::new(db),
            uploads: UploadTaskManager::new(tasks.clone()),
            downloads: DownloadTaskManager::new(tasks.clone()),
            enumerations: EnumerationTaskManager::new(tasks.clone()),
            deletions: DeletionTaskManager::new(tasks.clone()),
            reparents: ReparentTaskManager::new(tasks),
        }
    }
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock nanoseconds, strictly increasing within the process so task
/// records created back to back never share a `created_at`.
pub(crate) fn now_nanos() -> i64 {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
    let previous = LAST_STAMP
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1)
}

pub(crate) fn item_type_as_str(item_type: ItemType) -> &'static str {
    match item_type {
        ItemType::File => "file",
        ItemType::Folder => "folder",
    }
}

pub(crate) fn parse_item_type(value: &str) -> Result<ItemType, StoreError> {
    match value {
        "file" => Ok(ItemType::File),
        "folder" => Ok(ItemType::Folder),
        other => Err(StoreError::InvalidItemType(other.to_string())),
    }
}

pub(crate) fn parse_path(value: String) -> Result<CloudPath, StoreError> {
    Ok(CloudPath::try_from(value)?)
}
