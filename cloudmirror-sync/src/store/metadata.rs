use cloudmirror_core::{CloudItem, CloudPath, ItemType};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{Database, StoreError, item_type_as_str, parse_item_type, parse_path};

pub const ROOT_ITEM_ID: i64 = 1;

const ITEM_COLUMNS: &str = "id, parent_id, name, path, item_type, size, last_modified, status, is_placeholder, maybe_outdated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Uploading,
    Uploaded,
    UploadError,
    Downloading,
    DownloadError,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Uploading => "uploading",
            ItemStatus::Uploaded => "uploaded",
            ItemStatus::UploadError => "upload_error",
            ItemStatus::Downloading => "downloading",
            ItemStatus::DownloadError => "download_error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "uploading" => Ok(ItemStatus::Uploading),
            "uploaded" => Ok(ItemStatus::Uploaded),
            "upload_error" => Ok(ItemStatus::UploadError),
            "downloading" => Ok(ItemStatus::Downloading),
            "download_error" => Ok(ItemStatus::DownloadError),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub path: CloudPath,
    pub item_type: ItemType,
    pub size: Option<i64>,
    pub last_modified: Option<i64>,
    pub status: ItemStatus,
    pub is_placeholder: bool,
    pub maybe_outdated: bool,
}

impl ItemMetadata {
    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub parent_id: i64,
    pub name: String,
    pub path: CloudPath,
    pub item_type: ItemType,
    pub size: Option<i64>,
    pub last_modified: Option<i64>,
    pub status: ItemStatus,
    pub is_placeholder: bool,
}

fn item_from_row(row: &SqliteRow) -> Result<ItemMetadata, StoreError> {
    let item_type: String = row.try_get("item_type")?;
    let status: String = row.try_get("status")?;
    Ok(ItemMetadata {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        path: parse_path(row.try_get("path")?)?,
        item_type: parse_item_type(&item_type)?,
        size: row.try_get("size")?,
        last_modified: row.try_get("last_modified")?,
        status: ItemStatus::parse(&status)?,
        is_placeholder: row.try_get("is_placeholder")?,
        maybe_outdated: row.try_get("maybe_outdated")?,
    })
}

/// Prefix that every strict descendant path of `path` starts with, and its
/// length in characters for SQLite's `substr`.
fn descendant_prefix(path: &CloudPath) -> (String, i64) {
    let prefix = if path.is_root() {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    let len = prefix.chars().count() as i64;
    (prefix, len)
}

pub(crate) async fn set_status_on(
    conn: &mut SqliteConnection,
    item_id: i64,
    status: ItemStatus,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE metadata SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(item_id)
        .execute(conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::MissingItem(item_id));
    }
    Ok(())
}

/// Local mirror of remote item metadata, including placeholders for items
/// that do not exist remotely yet.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn item(&self, item_id: i64) -> Result<Option<ItemMetadata>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM metadata WHERE id = ?1"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn require_item(&self, item_id: i64) -> Result<ItemMetadata, StoreError> {
        self.item(item_id)
            .await?
            .ok_or(StoreError::MissingItem(item_id))
    }

    pub async fn item_for_path(&self, path: &CloudPath) -> Result<Option<ItemMetadata>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM metadata WHERE path = ?1"
        ))
        .bind(path.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn items(&self, ids: &[i64]) -> Result<Vec<ItemMetadata>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.item(*id).await? {
                out.push(item);
            }
        }
        Ok(out)
    }

    pub async fn children(&self, parent_id: i64) -> Result<Vec<ItemMetadata>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM metadata WHERE parent_id = ?1 ORDER BY name ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn placeholders(&self, parent_id: i64) -> Result<Vec<ItemMetadata>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM metadata WHERE parent_id = ?1 AND is_placeholder = 1 ORDER BY name ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Every strict descendant of `path`, shallowest first.
    pub async fn descendants(&self, path: &CloudPath) -> Result<Vec<ItemMetadata>, StoreError> {
        let (prefix, len) = descendant_prefix(path);
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM metadata WHERE substr(path, 1, ?2) = ?1 AND path != ?3"
        ))
        .bind(prefix)
        .bind(len)
        .bind(path.as_str())
        .fetch_all(&self.pool)
        .await?;
        let mut items = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    pub async fn insert_item(&self, item: &NewItem) -> Result<ItemMetadata, StoreError> {
        let result = sqlx::query(
            "INSERT INTO metadata (parent_id, name, path, item_type, size, last_modified, status, is_placeholder, maybe_outdated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        )
        .bind(item.parent_id)
        .bind(&item.name)
        .bind(item.path.as_str())
        .bind(item_type_as_str(item.item_type))
        .bind(item.size)
        .bind(item.last_modified)
        .bind(item.status.as_str())
        .bind(item.is_placeholder)
        .execute(&self.pool)
        .await?;
        self.require_item(result.last_insert_rowid()).await
    }

    /// Records a listed remote item under `parent_id`. An existing entry for
    /// the same path keeps its id and status and stops being maybe-outdated.
    pub async fn cache_remote_item(
        &self,
        parent_id: i64,
        remote: &CloudItem,
    ) -> Result<ItemMetadata, StoreError> {
        sqlx::query(
            "INSERT INTO metadata (parent_id, name, path, item_type, size, last_modified, status, is_placeholder, maybe_outdated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'uploaded', 0, 0)
             ON CONFLICT(path) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                item_type = excluded.item_type,
                size = excluded.size,
                last_modified = excluded.last_modified,
                is_placeholder = 0,
                maybe_outdated = 0",
        )
        .bind(parent_id)
        .bind(&remote.name)
        .bind(remote.path.as_str())
        .bind(item_type_as_str(remote.item_type))
        .bind(remote.size.map(|size| size as i64))
        .bind(remote.last_modified)
        .execute(&self.pool)
        .await?;

        self.item_for_path(&remote.path)
            .await?
            .ok_or_else(|| StoreError::MissingPath(remote.path.clone()))
    }

    pub async fn flag_children_maybe_outdated(&self, parent_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE metadata SET maybe_outdated = 1 WHERE parent_id = ?1 AND is_placeholder = 0",
        )
        .bind(parent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn maybe_outdated_children(
        &self,
        parent_id: i64,
    ) -> Result<Vec<ItemMetadata>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM metadata WHERE parent_id = ?1 AND maybe_outdated = 1 ORDER BY name ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn set_status(&self, item_id: i64, status: ItemStatus) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        set_status_on(&mut conn, item_id, status).await
    }

    /// Applies the metadata the provider returned for an upload or folder
    /// creation; the item stops being a placeholder.
    pub async fn mark_uploaded(&self, item_id: i64, remote: &CloudItem) -> Result<ItemMetadata, StoreError> {
        sqlx::query(
            "UPDATE metadata SET size = ?1, last_modified = ?2, status = 'uploaded', is_placeholder = 0, maybe_outdated = 0 WHERE id = ?3",
        )
        .bind(remote.size.map(|size| size as i64))
        .bind(remote.last_modified)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        self.require_item(item_id).await
    }

    pub async fn set_size(&self, item_id: i64, size: Option<i64>) -> Result<(), StoreError> {
        sqlx::query("UPDATE metadata SET size = ?1 WHERE id = ?2")
            .bind(size)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves the item to `new_path` under `new_parent_id` and rewrites the
    /// paths of its whole subtree in one transaction.
    pub async fn relocate(
        &self,
        item_id: i64,
        new_parent_id: i64,
        new_path: &CloudPath,
    ) -> Result<ItemMetadata, StoreError> {
        let item = self.require_item(item_id).await?;
        let new_name = new_path.name().unwrap_or_default().to_string();
        let (prefix, len) = descendant_prefix(&item.path);

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id, path FROM metadata WHERE substr(path, 1, ?2) = ?1 AND path != ?3")
            .bind(prefix)
            .bind(len)
            .bind(item.path.as_str())
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("UPDATE metadata SET parent_id = ?1, name = ?2, path = ?3 WHERE id = ?4")
            .bind(new_parent_id)
            .bind(&new_name)
            .bind(new_path.as_str())
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            let id: i64 = row.try_get("id")?;
            let old = parse_path(row.try_get("path")?)?;
            let Some(rebased) = old.rebase(&item.path, new_path) else {
                continue;
            };
            sqlx::query("UPDATE metadata SET path = ?1 WHERE id = ?2")
                .bind(rebased.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.require_item(item_id).await
    }

    /// Deletes the entry. Descendants and cache rows cascade; task records go
    /// too, except deletion records.
    pub async fn remove_item(&self, item_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM metadata WHERE id = ?1 AND id != ?2")
            .bind(item_id)
            .bind(ROOT_ITEM_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
