use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::{Database, StoreError, now_nanos};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCachedFileInfo {
    pub item_id: i64,
    pub local_path: PathBuf,
    /// Remote modification time of the version the cached bytes belong to.
    pub remote_last_modified: Option<i64>,
    /// When the cache entry was last written locally.
    pub local_last_modified: i64,
}

impl LocalCachedFileInfo {
    /// Compares at second granularity; an unknown time on either side is
    /// never current.
    pub fn is_current_version(&self, remote_last_modified: Option<i64>) -> bool {
        match (self.remote_last_modified, remote_last_modified) {
            (Some(cached), Some(remote)) => {
                cached.div_euclid(NANOS_PER_SECOND) == remote.div_euclid(NANOS_PER_SECOND)
            }
            _ => false,
        }
    }
}

fn info_from_row(row: &SqliteRow) -> Result<LocalCachedFileInfo, StoreError> {
    let local_path: String = row.try_get("local_path")?;
    Ok(LocalCachedFileInfo {
        item_id: row.try_get("item_id")?,
        local_path: PathBuf::from(local_path),
        remote_last_modified: row.try_get("remote_last_modified")?,
        local_last_modified: row.try_get("local_last_modified")?,
    })
}

async fn remove_file_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Bookkeeping for file bytes held in the local cache directory.
#[derive(Clone)]
pub struct CachedFileManager {
    pool: SqlitePool,
}

impl CachedFileManager {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get_local_cached_file_info(
        &self,
        item_id: i64,
    ) -> Result<Option<LocalCachedFileInfo>, StoreError> {
        let row = sqlx::query(
            "SELECT item_id, local_path, remote_last_modified, local_last_modified FROM cached_files WHERE item_id = ?1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(info_from_row).transpose()
    }

    /// Records that `local_path` now holds the bytes of the remote version
    /// modified at `remote_last_modified`. The local time is set to now.
    pub async fn cache_local_file_info(
        &self,
        item_id: i64,
        local_path: &Path,
        remote_last_modified: Option<i64>,
    ) -> Result<LocalCachedFileInfo, StoreError> {
        let info = LocalCachedFileInfo {
            item_id,
            local_path: local_path.to_path_buf(),
            remote_last_modified,
            local_last_modified: now_nanos(),
        };
        sqlx::query(
            "INSERT INTO cached_files (item_id, local_path, remote_last_modified, local_last_modified)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                local_path = excluded.local_path,
                remote_last_modified = excluded.remote_last_modified,
                local_last_modified = excluded.local_last_modified",
        )
        .bind(item_id)
        .bind(info.local_path.to_string_lossy().into_owned())
        .bind(remote_last_modified)
        .bind(info.local_last_modified)
        .execute(&self.pool)
        .await?;
        Ok(info)
    }

    async fn has_upload_record(&self, item_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM task_records WHERE item_id = ?1 AND kind = 'upload'")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Deletes the cached bytes and their entry. Refuses while an upload of
    /// the item is pending; a file already gone from disk is fine.
    pub async fn remove_cached_file(&self, item_id: i64) -> Result<(), StoreError> {
        if self.has_upload_record(item_id).await? {
            return Err(StoreError::FileHasUnsyncedEdits(item_id));
        }
        let Some(info) = self.get_local_cached_file_info(item_id).await? else {
            return Ok(());
        };
        remove_file_if_present(&info.local_path).await?;
        sqlx::query("DELETE FROM cached_files WHERE item_id = ?1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        debug!(item_id, path = %info.local_path.display(), "cached file removed");
        Ok(())
    }

    /// Evicts every cached file without pending edits; returns how many were
    /// removed.
    pub async fn clear_cache(&self) -> Result<usize, StoreError> {
        let rows = sqlx::query(
            "SELECT item_id, local_path, remote_last_modified, local_last_modified FROM cached_files
             WHERE item_id NOT IN (SELECT item_id FROM task_records WHERE kind = 'upload')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for row in &rows {
            let info = info_from_row(row)?;
            if let Err(err) = remove_file_if_present(&info.local_path).await {
                warn!(item_id = info.item_id, error = %err, "failed to evict cached file");
                continue;
            }
            sqlx::query("DELETE FROM cached_files WHERE item_id = ?1")
                .bind(info.item_id)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }
        debug!(removed, "cache cleared");
        Ok(removed)
    }

    /// Bytes currently held on disk by cached files.
    pub async fn local_cache_size_bytes(&self) -> Result<u64, StoreError> {
        let rows = sqlx::query("SELECT local_path FROM cached_files")
            .fetch_all(&self.pool)
            .await?;
        let mut total = 0u64;
        for row in rows {
            let local_path: String = row.try_get("local_path")?;
            match tokio::fs::metadata(&local_path).await {
                Ok(meta) => total += meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::metadata::{ItemStatus, MetadataStore, NewItem, ROOT_ITEM_ID};
    use cloudmirror_core::{CloudPath, ItemType};
    use tempfile::tempdir;

    async fn make_item(db: &Database, name: &str) -> i64 {
        let path = CloudPath::root().join(name).unwrap();
        MetadataStore::new(db)
            .insert_item(&NewItem {
                parent_id: ROOT_ITEM_ID,
                name: name.to_string(),
                path,
                item_type: ItemType::File,
                size: None,
                last_modified: None,
                status: ItemStatus::Uploaded,
                is_placeholder: false,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn current_version_compares_whole_seconds() {
        let info = LocalCachedFileInfo {
            item_id: 2,
            local_path: PathBuf::from("/cache/2/a"),
            remote_last_modified: Some(5 * NANOS_PER_SECOND + 10),
            local_last_modified: 0,
        };
        assert!(info.is_current_version(Some(5 * NANOS_PER_SECOND + 999)));
        assert!(!info.is_current_version(Some(6 * NANOS_PER_SECOND)));
        assert!(!info.is_current_version(None));
    }

    #[tokio::test]
    async fn caches_and_removes_file_info() {
        let db = Database::in_memory().await.unwrap();
        let cache = CachedFileManager::new(&db);
        let dir = tempdir().unwrap();
        let id = make_item(&db, "a.txt").await;
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"abc").unwrap();

        let stored = cache.cache_local_file_info(id, &local, Some(7)).await.unwrap();
        let fetched = cache.get_local_cached_file_info(id).await.unwrap().unwrap();
        assert_eq!(stored, fetched);
        assert_eq!(cache.local_cache_size_bytes().await.unwrap(), 3);

        cache.remove_cached_file(id).await.unwrap();
        assert!(!local.exists());
        assert!(cache.get_local_cached_file_info(id).await.unwrap().is_none());
        cache.remove_cached_file(id).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_to_remove_file_with_pending_upload() {
        let db = Database::in_memory().await.unwrap();
        let cache = CachedFileManager::new(&db);
        let dir = tempdir().unwrap();
        let id = make_item(&db, "a.txt").await;
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"abc").unwrap();
        cache.cache_local_file_info(id, &local, None).await.unwrap();
        sqlx::query("INSERT INTO task_records (item_id, kind, target_path, created_at) VALUES (?1, 'upload', '/a.txt', 0)")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = cache.remove_cached_file(id).await.unwrap_err();
        assert!(matches!(err, StoreError::FileHasUnsyncedEdits(item) if item == id));
        assert_eq!(cache.clear_cache().await.unwrap(), 0);
        assert!(local.exists());
    }

    #[tokio::test]
    async fn clear_cache_tolerates_missing_files() {
        let db = Database::in_memory().await.unwrap();
        let cache = CachedFileManager::new(&db);
        let dir = tempdir().unwrap();
        let a = make_item(&db, "a.txt").await;
        let b = make_item(&db, "b.txt").await;
        let present = dir.path().join("a.txt");
        std::fs::write(&present, b"abc").unwrap();
        cache.cache_local_file_info(a, &present, None).await.unwrap();
        cache
            .cache_local_file_info(b, &dir.path().join("gone.txt"), None)
            .await
            .unwrap();

        assert_eq!(cache.clear_cache().await.unwrap(), 2);
        assert!(!present.exists());
        assert_eq!(cache.local_cache_size_bytes().await.unwrap(), 0);
    }
}
