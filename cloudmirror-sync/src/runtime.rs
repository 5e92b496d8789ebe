use std::sync::Arc;

use anyhow::Context;
use cloudmirror_core::RemoteProvider;
use tracing::info;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::store::Database;

/// Opened database, cache directory and engine for one host process.
pub struct SyncRuntime {
    config: SyncConfig,
    db: Database,
    engine: SyncEngine,
}

impl SyncRuntime {
    pub async fn bootstrap(
        config: SyncConfig,
        provider: Arc<dyn RemoteProvider>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", config.cache_dir.display()))?;
        let db = Database::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
        let engine = SyncEngine::new(&db, provider, &config);
        info!(
            db = %config.db_path.display(),
            cache = %config.cache_dir.display(),
            uploads = config.max_parallel_uploads,
            downloads = config.max_parallel_downloads,
            "sync runtime ready"
        );
        Ok(Self { config, db, engine })
    }

    /// Loads `.env` if present, then bootstraps from the environment.
    pub async fn bootstrap_from_env(provider: Arc<dyn RemoteProvider>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::bootstrap(SyncConfig::from_env(), provider).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmirror_core::{CloudPath, MemoryProvider};
    use crate::store::ROOT_ITEM_ID;

    #[tokio::test]
    async fn bootstrap_creates_database_and_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            db_path: dir.path().join("state").join("sync.db"),
            cache_dir: dir.path().join("cache"),
            max_parallel_uploads: 1,
            max_parallel_downloads: 2,
        };
        let provider = Arc::new(MemoryProvider::new());
        provider.insert_file(&CloudPath::new("/a.txt").unwrap(), b"a").await;

        let runtime = SyncRuntime::bootstrap(config.clone(), provider).await.unwrap();
        assert!(config.db_path.exists());
        assert!(config.cache_dir.is_dir());
        assert_eq!(runtime.config(), &config);

        let listing = runtime
            .engine()
            .enumerate_items(ROOT_ITEM_ID, None)
            .await
            .unwrap();
        assert_eq!(listing.items.len(), 1);
    }

    #[tokio::test]
    async fn reopening_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            db_path: dir.path().join("sync.db"),
            cache_dir: dir.path().join("cache"),
            ..SyncConfig::default()
        };
        let provider = Arc::new(MemoryProvider::new());
        provider.insert_folder(&CloudPath::new("/docs").unwrap()).await;

        let first = SyncRuntime::bootstrap(config.clone(), provider.clone()).await.unwrap();
        first.engine().enumerate_items(ROOT_ITEM_ID, None).await.unwrap();
        first.database().pool().close().await;

        let second = SyncRuntime::bootstrap(config, provider).await.unwrap();
        let docs = second
            .engine()
            .item_for_path(&CloudPath::new("/docs").unwrap())
            .await
            .unwrap();
        assert!(docs.is_some());
    }
}
