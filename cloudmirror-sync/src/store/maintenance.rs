use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{Database, StoreError};

/// Guards the database against new task records, so the host can move or
/// rebuild the whole mirror while nothing is in flight.
///
/// The guard lives in the schema: triggers refuse task inserts while the mode
/// is on, and refuse turning it on while any record has not failed.
#[derive(Clone)]
pub struct MaintenanceManager {
    pool: SqlitePool,
}

impl MaintenanceManager {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Fails with [`StoreError::RunningTask`] while a task is running or
    /// pending, or when the mode is already on. Failed tasks do not count.
    pub async fn enable_maintenance_mode(&self) -> Result<(), StoreError> {
        self.set(true).await?;
        info!("maintenance mode enabled");
        Ok(())
    }

    pub async fn disable_maintenance_mode(&self) -> Result<(), StoreError> {
        self.set(false).await?;
        info!("maintenance mode disabled");
        Ok(())
    }

    pub async fn is_enabled(&self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT enabled FROM maintenance_mode WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<bool, _>("enabled")?),
            None => Ok(false),
        }
    }

    async fn set(&self, enabled: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE maintenance_mode SET enabled = ?1 WHERE id = 1")
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailureKind, ItemMetadata, ItemStatus, NewItem, ROOT_ITEM_ID, Stores};
    use cloudmirror_core::{CloudPath, ItemType};
    use std::path::PathBuf;

    fn p(raw: &str) -> CloudPath {
        CloudPath::new(raw).unwrap()
    }

    async fn make_stores() -> Stores {
        Stores::new(&Database::in_memory().await.unwrap())
    }

    async fn make_file(stores: &Stores, path: &str) -> ItemMetadata {
        let path = p(path);
        stores
            .metadata
            .insert_item(&NewItem {
                parent_id: ROOT_ITEM_ID,
                name: path.name().unwrap().to_string(),
                path,
                item_type: ItemType::File,
                size: None,
                last_modified: None,
                status: ItemStatus::Uploaded,
                is_placeholder: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enabling_twice_is_refused() {
        let stores = make_stores().await;
        assert!(!stores.maintenance.is_enabled().await.unwrap());

        stores.maintenance.enable_maintenance_mode().await.unwrap();
        assert!(stores.maintenance.is_enabled().await.unwrap());
        let err = stores.maintenance.enable_maintenance_mode().await.unwrap_err();
        assert!(matches!(err, StoreError::RunningTask));
    }

    #[tokio::test]
    async fn no_task_kind_can_be_created_while_enabled() {
        let stores = make_stores().await;
        let item = make_file(&stores, "/test").await;
        stores.maintenance.enable_maintenance_mode().await.unwrap();

        let refused = [
            stores.uploads.create_task_record(&item).await.unwrap_err(),
            stores
                .downloads
                .create_task_record(&item, PathBuf::from("/cache/test"), true)
                .await
                .unwrap_err(),
            stores
                .enumerations
                .create_task_record(&item, None)
                .await
                .unwrap_err(),
            stores.deletions.create_task_record(&item).await.unwrap_err(),
            stores
                .reparents
                .create_task_record(item.id, &item.path, &p("/foo"), ROOT_ITEM_ID, ROOT_ITEM_ID)
                .await
                .unwrap_err(),
        ];
        for err in refused {
            assert!(matches!(err, StoreError::MaintenanceMode), "{err}");
        }
        let stored = stores.metadata.require_item(item.id).await.unwrap();
        assert_eq!(stored.status, ItemStatus::Uploaded);
    }

    #[tokio::test]
    async fn pending_task_blocks_enabling() {
        let stores = make_stores().await;
        let item = make_file(&stores, "/test").await;
        stores
            .reparents
            .create_task_record(item.id, &item.path, &p("/foo"), ROOT_ITEM_ID, ROOT_ITEM_ID)
            .await
            .unwrap();

        let err = stores.maintenance.enable_maintenance_mode().await.unwrap_err();
        assert!(matches!(err, StoreError::RunningTask));
        assert!(!stores.maintenance.is_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn failed_task_does_not_block_enabling() {
        let stores = make_stores().await;
        let item = make_file(&stores, "/test").await;
        stores.uploads.create_task_record(&item).await.unwrap();
        stores
            .uploads
            .record_failure(item.id, FailureKind::QuotaExceeded)
            .await
            .unwrap();

        stores.maintenance.enable_maintenance_mode().await.unwrap();
        assert!(stores.maintenance.is_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn refused_replacement_keeps_the_live_record() {
        let stores = make_stores().await;
        let item = make_file(&stores, "/test").await;
        let failed = stores.uploads.create_task_record(&item).await.unwrap();
        stores
            .uploads
            .record_failure(item.id, FailureKind::NoConnection)
            .await
            .unwrap();
        stores.maintenance.enable_maintenance_mode().await.unwrap();

        let err = stores.uploads.replace_task_record(&item).await.unwrap_err();
        assert!(matches!(err, StoreError::MaintenanceMode));
        let kept = stores.uploads.get_task_record(item.id).await.unwrap().unwrap();
        assert_eq!(kept.created_at, failed.created_at);
    }

    #[tokio::test]
    async fn disabling_accepts_tasks_again() {
        let stores = make_stores().await;
        let item = make_file(&stores, "/test").await;
        stores.maintenance.enable_maintenance_mode().await.unwrap();
        stores.maintenance.disable_maintenance_mode().await.unwrap();

        stores.uploads.create_task_record(&item).await.unwrap();
        assert!(!stores.maintenance.is_enabled().await.unwrap());
    }
}
