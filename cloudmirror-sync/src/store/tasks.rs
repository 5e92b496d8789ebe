use std::fmt;
use std::path::PathBuf;

use cloudmirror_core::{CloudPath, ItemType, ProviderError};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use super::metadata::{ItemMetadata, ItemStatus, set_status_on};
use super::{Database, StoreError, item_type_as_str, now_nanos, parse_item_type, parse_path};

const TASK_COLUMNS: &str = "item_id, kind, target_path, created_at, last_failure_at, failure_kind, page_token, local_path, replace_existing, subtree_path, source_path, old_parent_id, new_parent_id, item_type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Enumeration,
    Download,
    Upload,
    Deletion,
    Reparent,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Enumeration => "enumeration",
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
            TaskKind::Deletion => "deletion",
            TaskKind::Reparent => "reparent",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "enumeration" => Ok(TaskKind::Enumeration),
            "download" => Ok(TaskKind::Download),
            "upload" => Ok(TaskKind::Upload),
            "deletion" => Ok(TaskKind::Deletion),
            "reparent" => Ok(TaskKind::Reparent),
            other => Err(StoreError::InvalidTaskKind(other.to_string())),
        }
    }

    /// Status an item enters when a record of this kind is created.
    pub fn in_flight_status(&self) -> Option<ItemStatus> {
        match self {
            TaskKind::Upload | TaskKind::Reparent => Some(ItemStatus::Uploading),
            TaskKind::Download => Some(ItemStatus::Downloading),
            TaskKind::Enumeration | TaskKind::Deletion => None,
        }
    }

    /// Status an item enters when a task of this kind fails.
    pub fn error_status(&self) -> Option<ItemStatus> {
        match self {
            TaskKind::Upload | TaskKind::Reparent => Some(ItemStatus::UploadError),
            TaskKind::Download => Some(ItemStatus::DownloadError),
            TaskKind::Enumeration | TaskKind::Deletion => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    Unauthorized,
    NoConnection,
    LocalIo,
    InconsistentItem,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::AlreadyExists => "already_exists",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::NoConnection => "no_connection",
            FailureKind::LocalIo => "local_io",
            FailureKind::InconsistentItem => "inconsistent_item",
            FailureKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "not_found" => Ok(FailureKind::NotFound),
            "already_exists" => Ok(FailureKind::AlreadyExists),
            "quota_exceeded" => Ok(FailureKind::QuotaExceeded),
            "unauthorized" => Ok(FailureKind::Unauthorized),
            "no_connection" => Ok(FailureKind::NoConnection),
            "local_io" => Ok(FailureKind::LocalIo),
            "inconsistent_item" => Ok(FailureKind::InconsistentItem),
            "other" => Ok(FailureKind::Other),
            other => Err(StoreError::InvalidFailureKind(other.to_string())),
        }
    }
}

impl From<&ProviderError> for FailureKind {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::NotFound(_) => FailureKind::NotFound,
            ProviderError::AlreadyExists(_) => FailureKind::AlreadyExists,
            ProviderError::QuotaExceeded => FailureKind::QuotaExceeded,
            ProviderError::Unauthorized => FailureKind::Unauthorized,
            ProviderError::NoConnection => FailureKind::NoConnection,
            ProviderError::Io(_) => FailureKind::LocalIo,
            ProviderError::Other(_) => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDetails {
    Enumeration {
        page_token: Option<String>,
    },
    Download {
        local_path: PathBuf,
        replace_existing: bool,
    },
    Upload,
    Deletion {
        subtree_path: CloudPath,
        parent_id: i64,
        item_type: ItemType,
    },
    Reparent {
        source_path: CloudPath,
        target_path: CloudPath,
        old_parent_id: i64,
        new_parent_id: i64,
    },
}

impl TaskDetails {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskDetails::Enumeration { .. } => TaskKind::Enumeration,
            TaskDetails::Download { .. } => TaskKind::Download,
            TaskDetails::Upload => TaskKind::Upload,
            TaskDetails::Deletion { .. } => TaskKind::Deletion,
            TaskDetails::Reparent { .. } => TaskKind::Reparent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub item_id: i64,
    pub target_path: CloudPath,
    pub created_at: i64,
    pub last_failure_at: Option<i64>,
    pub failure_kind: Option<FailureKind>,
    pub details: TaskDetails,
}

impl TaskRecord {
    pub fn kind(&self) -> TaskKind {
        self.details.kind()
    }

    pub fn has_failed(&self) -> bool {
        self.last_failure_at.is_some()
    }
}

fn required<T>(value: Option<T>, column: &'static str) -> Result<T, StoreError> {
    value.ok_or(StoreError::IncompleteTask(column))
}

fn record_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let details = match TaskKind::parse(&kind)? {
        TaskKind::Enumeration => TaskDetails::Enumeration {
            page_token: row.try_get("page_token")?,
        },
        TaskKind::Download => {
            let local_path: Option<String> = row.try_get("local_path")?;
            let replace_existing: Option<bool> = row.try_get("replace_existing")?;
            TaskDetails::Download {
                local_path: PathBuf::from(required(local_path, "local_path")?),
                replace_existing: replace_existing.unwrap_or(false),
            }
        }
        TaskKind::Upload => TaskDetails::Upload,
        TaskKind::Deletion => {
            let subtree_path: Option<String> = row.try_get("subtree_path")?;
            let item_type: Option<String> = row.try_get("item_type")?;
            TaskDetails::Deletion {
                subtree_path: parse_path(required(subtree_path, "subtree_path")?)?,
                parent_id: required(row.try_get("old_parent_id")?, "old_parent_id")?,
                item_type: parse_item_type(&required(item_type, "item_type")?)?,
            }
        }
        TaskKind::Reparent => {
            let source_path: Option<String> = row.try_get("source_path")?;
            let target_path: String = row.try_get("target_path")?;
            TaskDetails::Reparent {
                source_path: parse_path(required(source_path, "source_path")?)?,
                target_path: parse_path(target_path)?,
                old_parent_id: required(row.try_get("old_parent_id")?, "old_parent_id")?,
                new_parent_id: required(row.try_get("new_parent_id")?, "new_parent_id")?,
            }
        }
    };
    Ok(TaskRecord {
        item_id: row.try_get("item_id")?,
        target_path: parse_path(row.try_get("target_path")?)?,
        created_at: row.try_get("created_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        failure_kind: failure_kind.as_deref().map(FailureKind::parse).transpose()?,
        details,
    })
}

async fn fetch_on(
    conn: &mut SqliteConnection,
    item_id: i64,
    kind: TaskKind,
) -> Result<Option<TaskRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM task_records WHERE item_id = ?1 AND kind = ?2"
    ))
    .bind(item_id)
    .bind(kind.as_str())
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Persisted per-item, per-kind task state. At most one record exists for
/// each `(item_id, kind)` pair.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Inserts the record and moves the item into its in-flight status in one
    /// transaction. Fails with `TaskExists` if a record of the kind is live.
    pub async fn create(
        &self,
        item_id: i64,
        target_path: &CloudPath,
        details: TaskDetails,
    ) -> Result<TaskRecord, StoreError> {
        self.insert(item_id, target_path, details, false).await
    }

    /// Like [`TaskStore::create`], but discards a live record of the same kind
    /// within the same transaction.
    pub async fn replace(
        &self,
        item_id: i64,
        target_path: &CloudPath,
        details: TaskDetails,
    ) -> Result<TaskRecord, StoreError> {
        self.insert(item_id, target_path, details, true).await
    }

    async fn insert(
        &self,
        item_id: i64,
        target_path: &CloudPath,
        details: TaskDetails,
        replace: bool,
    ) -> Result<TaskRecord, StoreError> {
        let kind = details.kind();
        let record = TaskRecord {
            item_id,
            target_path: target_path.clone(),
            created_at: now_nanos(),
            last_failure_at: None,
            failure_kind: None,
            details,
        };

        let (mut page_token, mut local_path, mut replace_existing) = (None, None, None);
        let (mut subtree_path, mut source_path, mut item_type) = (None, None, None);
        let (mut old_parent_id, mut new_parent_id) = (None, None);
        match &record.details {
            TaskDetails::Enumeration { page_token: token } => page_token = token.clone(),
            TaskDetails::Download {
                local_path: path,
                replace_existing: replace,
            } => {
                local_path = Some(path.to_string_lossy().into_owned());
                replace_existing = Some(*replace);
            }
            TaskDetails::Upload => {}
            TaskDetails::Deletion {
                subtree_path: path,
                parent_id,
                item_type: deleted_type,
            } => {
                subtree_path = Some(path.as_str().to_string());
                old_parent_id = Some(*parent_id);
                item_type = Some(item_type_as_str(*deleted_type));
            }
            TaskDetails::Reparent {
                source_path: source,
                old_parent_id: old,
                new_parent_id: new,
                ..
            } => {
                source_path = Some(source.as_str().to_string());
                old_parent_id = Some(*old);
                new_parent_id = Some(*new);
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut replaced = false;
        if replace {
            // Writing first makes concurrent replacers queue on the database
            // write lock instead of failing to upgrade a read.
            replaced = sqlx::query("DELETE FROM task_records WHERE item_id = ?1 AND kind = ?2")
                .bind(item_id)
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        } else if fetch_on(&mut tx, item_id, kind).await?.is_some() {
            return Err(StoreError::TaskExists { item_id, kind });
        }
        sqlx::query(
            "INSERT INTO task_records (item_id, kind, target_path, created_at, page_token, local_path, replace_existing, subtree_path, source_path, old_parent_id, new_parent_id, item_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(item_id)
        .bind(kind.as_str())
        .bind(target_path.as_str())
        .bind(record.created_at)
        .bind(page_token)
        .bind(local_path)
        .bind(replace_existing)
        .bind(subtree_path)
        .bind(source_path)
        .bind(old_parent_id)
        .bind(new_parent_id)
        .bind(item_type)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_write)?;
        if let Some(status) = kind.in_flight_status() {
            set_status_on(&mut tx, item_id, status).await?;
        }
        tx.commit().await?;

        debug!(item_id, %kind, path = %target_path, replaced, "task record created");
        Ok(record)
    }

    pub async fn get(&self, item_id: i64, kind: TaskKind) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_on(&mut conn, item_id, kind).await
    }

    pub async fn remove(&self, item_id: i64, kind: TaskKind) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM task_records WHERE item_id = ?1 AND kind = ?2")
            .bind(item_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the record only if it is still the one that was read, so a
    /// record created after it survives.
    pub async fn complete(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM task_records WHERE item_id = ?1 AND kind = ?2 AND created_at = ?3",
        )
        .bind(record.item_id)
        .bind(record.kind().as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamps the failure on the record and moves the item into the matching
    /// error status in one transaction.
    pub async fn record_failure(
        &self,
        item_id: i64,
        kind: TaskKind,
        failure: FailureKind,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE task_records SET last_failure_at = ?1, failure_kind = ?2 WHERE item_id = ?3 AND kind = ?4",
        )
        .bind(now_nanos())
        .bind(failure.as_str())
        .bind(item_id)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await?;
        if let Some(status) = kind.error_status() {
            set_status_on(&mut tx, item_id, status).await?;
        }
        let record = if result.rows_affected() > 0 {
            fetch_on(&mut tx, item_id, kind).await?
        } else {
            None
        };
        tx.commit().await?;
        Ok(record)
    }

    pub async fn records_for_items(
        &self,
        kind: TaskKind,
        item_ids: &[i64],
    ) -> Result<Vec<Option<TaskRecord>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            out.push(fetch_on(&mut conn, *item_id, kind).await?);
        }
        Ok(out)
    }

    pub async fn records_by_old_parent(
        &self,
        kind: TaskKind,
        parent_id: i64,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_records WHERE kind = ?1 AND old_parent_id = ?2 ORDER BY created_at ASC"
        ))
        .bind(kind.as_str())
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn records_by_new_parent(
        &self,
        kind: TaskKind,
        parent_id: i64,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_records WHERE kind = ?1 AND new_parent_id = ?2 ORDER BY created_at ASC"
        ))
        .bind(kind.as_str())
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

macro_rules! task_record_accessors {
    ($kind:expr) => {
        pub fn new(store: TaskStore) -> Self {
            Self { store }
        }

        pub async fn get_task_record(&self, item_id: i64) -> Result<Option<TaskRecord>, StoreError> {
            self.store.get(item_id, $kind).await
        }

        pub async fn remove_task_record(&self, item_id: i64) -> Result<bool, StoreError> {
            self.store.remove(item_id, $kind).await
        }

        pub async fn complete_task_record(&self, record: &TaskRecord) -> Result<bool, StoreError> {
            self.store.complete(record).await
        }

        pub async fn record_failure(
            &self,
            item_id: i64,
            failure: FailureKind,
        ) -> Result<Option<TaskRecord>, StoreError> {
            self.store.record_failure(item_id, $kind, failure).await
        }
    };
}

#[derive(Clone)]
pub struct UploadTaskManager {
    store: TaskStore,
}

impl UploadTaskManager {
    task_record_accessors!(TaskKind::Upload);

    pub async fn create_task_record(&self, item: &ItemMetadata) -> Result<TaskRecord, StoreError> {
        self.store.create(item.id, &item.path, TaskDetails::Upload).await
    }

    pub async fn replace_task_record(&self, item: &ItemMetadata) -> Result<TaskRecord, StoreError> {
        self.store.replace(item.id, &item.path, TaskDetails::Upload).await
    }

    /// One entry per requested item, `None` where no upload is pending.
    pub async fn get_task_records(
        &self,
        item_ids: &[i64],
    ) -> Result<Vec<Option<TaskRecord>>, StoreError> {
        self.store.records_for_items(TaskKind::Upload, item_ids).await
    }
}

#[derive(Clone)]
pub struct DownloadTaskManager {
    store: TaskStore,
}

impl DownloadTaskManager {
    task_record_accessors!(TaskKind::Download);

    pub async fn create_task_record(
        &self,
        item: &ItemMetadata,
        local_path: PathBuf,
        replace_existing: bool,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Download {
            local_path,
            replace_existing,
        };
        self.store.create(item.id, &item.path, details).await
    }

    pub async fn replace_task_record(
        &self,
        item: &ItemMetadata,
        local_path: PathBuf,
        replace_existing: bool,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Download {
            local_path,
            replace_existing,
        };
        self.store.replace(item.id, &item.path, details).await
    }
}

#[derive(Clone)]
pub struct EnumerationTaskManager {
    store: TaskStore,
}

impl EnumerationTaskManager {
    task_record_accessors!(TaskKind::Enumeration);

    pub async fn create_task_record(
        &self,
        item: &ItemMetadata,
        page_token: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Enumeration { page_token };
        self.store.create(item.id, &item.path, details).await
    }

    pub async fn replace_task_record(
        &self,
        item: &ItemMetadata,
        page_token: Option<String>,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Enumeration { page_token };
        self.store.replace(item.id, &item.path, details).await
    }
}

#[derive(Clone)]
pub struct DeletionTaskManager {
    store: TaskStore,
}

impl DeletionTaskManager {
    task_record_accessors!(TaskKind::Deletion);

    fn details(item: &ItemMetadata) -> Result<TaskDetails, StoreError> {
        let parent_id = item.parent_id.ok_or(StoreError::MissingItem(item.id))?;
        Ok(TaskDetails::Deletion {
            subtree_path: item.path.clone(),
            parent_id,
            item_type: item.item_type,
        })
    }

    pub async fn create_task_record(&self, item: &ItemMetadata) -> Result<TaskRecord, StoreError> {
        self.store.create(item.id, &item.path, Self::details(item)?).await
    }

    pub async fn replace_task_record(&self, item: &ItemMetadata) -> Result<TaskRecord, StoreError> {
        self.store.replace(item.id, &item.path, Self::details(item)?).await
    }

    pub async fn records_which_were_in(&self, parent_id: i64) -> Result<Vec<TaskRecord>, StoreError> {
        self.store
            .records_by_old_parent(TaskKind::Deletion, parent_id)
            .await
    }
}

#[derive(Clone)]
pub struct ReparentTaskManager {
    store: TaskStore,
}

impl ReparentTaskManager {
    task_record_accessors!(TaskKind::Reparent);

    pub async fn create_task_record(
        &self,
        item_id: i64,
        source_path: &CloudPath,
        target_path: &CloudPath,
        old_parent_id: i64,
        new_parent_id: i64,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Reparent {
            source_path: source_path.clone(),
            target_path: target_path.clone(),
            old_parent_id,
            new_parent_id,
        };
        self.store.create(item_id, target_path, details).await
    }

    pub async fn replace_task_record(
        &self,
        item_id: i64,
        source_path: &CloudPath,
        target_path: &CloudPath,
        old_parent_id: i64,
        new_parent_id: i64,
    ) -> Result<TaskRecord, StoreError> {
        let details = TaskDetails::Reparent {
            source_path: source_path.clone(),
            target_path: target_path.clone(),
            old_parent_id,
            new_parent_id,
        };
        self.store.replace(item_id, target_path, details).await
    }

    pub async fn records_which_were_in(&self, parent_id: i64) -> Result<Vec<TaskRecord>, StoreError> {
        self.store
            .records_by_old_parent(TaskKind::Reparent, parent_id)
            .await
    }

    pub async fn records_which_are_soon_in(
        &self,
        parent_id: i64,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.store
            .records_by_new_parent(TaskKind::Reparent, parent_id)
            .await
    }
}

#[cfg(test)]
#[path = "tasks_tests.rs"]
mod tests;
