use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudmirror_core::{CloudPath, ItemType, PathError, RemoteProvider, validate_name};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{self, free_path};
use crate::error::EngineError;
use crate::item::{ProvidedItem, ProvidedItemList};
use crate::lock::{DependencyFactory, PathLockGraph};
use crate::paths::cache_path_for_item;
use crate::store::{
    Database, ItemMetadata, ItemStatus, NewItem, ROOT_ITEM_ID, Stores, TaskRecord,
};
use crate::workflow::{MetadataPage, ScheduledWorkflow, TaskExecutor, WorkflowFactory, WorkflowScheduler};

/// Local edits that would be overwritten by a download are parked here
/// before being imported as a new item.
const STAGING_DIR: &str = ".staging";

/// A local change that is already applied and whose remote counterpart runs
/// in the background.
pub struct PendingOperation<T> {
    pub item: ItemMetadata,
    workflow: Option<ScheduledWorkflow<T>>,
}

impl<T> PendingOperation<T> {
    fn scheduled(item: ItemMetadata, workflow: ScheduledWorkflow<T>) -> Self {
        Self {
            item,
            workflow: Some(workflow),
        }
    }

    fn settled(item: ItemMetadata) -> Self {
        Self {
            item,
            workflow: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.workflow.is_some()
    }

    /// Waits for the remote side. `None` when nothing had to be done
    /// remotely.
    pub async fn finished(self) -> Result<Option<T>, EngineError> {
        match self.workflow {
            Some(workflow) => workflow.await.map(Some),
            None => Ok(None),
        }
    }
}

impl<T> fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("item", &self.item)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Host-facing entry points of the sync core.
#[derive(Clone)]
pub struct SyncEngine {
    stores: Stores,
    factory: WorkflowFactory,
    cache_root: PathBuf,
}

impl SyncEngine {
    pub fn new(db: &Database, provider: Arc<dyn RemoteProvider>, config: &SyncConfig) -> Self {
        Self::with_scheduler(
            db,
            provider,
            config.cache_dir.clone(),
            WorkflowScheduler::from_config(config),
        )
    }

    pub fn with_scheduler(
        db: &Database,
        provider: Arc<dyn RemoteProvider>,
        cache_root: PathBuf,
        scheduler: WorkflowScheduler,
    ) -> Self {
        let stores = Stores::new(db);
        let executor = TaskExecutor::new(provider, stores.clone(), cache_root.clone());
        let factory = WorkflowFactory::new(DependencyFactory::default(), executor, scheduler);
        Self {
            stores,
            factory,
            cache_root,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn lock_graph(&self) -> &PathLockGraph {
        self.factory.dependencies().graph()
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        self.factory.scheduler()
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    async fn require(&self, item_id: i64) -> Result<ItemMetadata, EngineError> {
        self.stores
            .metadata
            .item(item_id)
            .await?
            .ok_or(EngineError::ItemNotFound(item_id))
    }

    async fn require_folder(&self, item_id: i64) -> Result<ItemMetadata, EngineError> {
        let item = self.require(item_id).await?;
        if !item.is_folder() {
            return Err(EngineError::ParentNotFolder(item_id));
        }
        Ok(item)
    }

    async fn require_file(&self, item_id: i64) -> Result<ItemMetadata, EngineError> {
        let item = self.require(item_id).await?;
        if item.is_folder() {
            return Err(EngineError::NotAFile(item_id));
        }
        Ok(item)
    }

    async fn provided(&self, items: Vec<ItemMetadata>) -> Result<Vec<ProvidedItem>, EngineError> {
        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        let uploads = self.stores.uploads.get_task_records(&ids).await?;
        let mut out = Vec::with_capacity(items.len());
        for (metadata, upload) in items.into_iter().zip(uploads) {
            let cached = self
                .stores
                .cache
                .get_local_cached_file_info(metadata.id)
                .await?;
            let newest_version_locally_cached = cached.as_ref().is_some_and(|info| {
                upload.is_some() || info.is_current_version(metadata.last_modified)
            });
            out.push(ProvidedItem {
                local_path: cached.map(|info| info.local_path),
                newest_version_locally_cached,
                upload_pending: upload.is_some(),
                upload_failure: upload.and_then(|record| record.failure_kind),
                metadata,
            });
        }
        Ok(out)
    }

    pub async fn item(&self, item_id: i64) -> Result<ProvidedItem, EngineError> {
        let item = self.require(item_id).await?;
        let mut provided = self.provided(vec![item]).await?;
        provided.pop().ok_or(EngineError::ItemNotFound(item_id))
    }

    pub async fn item_for_path(&self, path: &CloudPath) -> Result<Option<ProvidedItem>, EngineError> {
        match self.stores.metadata.item_for_path(path).await? {
            Some(item) => Ok(self.provided(vec![item]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn refresh(
        &self,
        item: &ItemMetadata,
        page_token: Option<String>,
    ) -> Result<MetadataPage, EngineError> {
        let record = self
            .stores
            .enumerations
            .replace_task_record(item, page_token)
            .await?;
        let workflow = self.factory.enumeration_workflow(item.clone(), record);
        self.scheduler().schedule(workflow).await
    }

    /// Lists one page of a folder, or refreshes a single file.
    pub async fn enumerate_items(
        &self,
        item_id: i64,
        page_token: Option<String>,
    ) -> Result<ProvidedItemList, EngineError> {
        let item = self.require(item_id).await?;
        let page = self.refresh(&item, page_token).await?;
        Ok(ProvidedItemList {
            items: self.provided(page.items).await?,
            next_page_token: page.next_page_token,
        })
    }

    pub async fn enumerate_items_extensively(
        &self,
        item_id: i64,
    ) -> Result<Vec<ProvidedItem>, EngineError> {
        let mut items = Vec::new();
        let mut page_token = None;
        loop {
            let page = self.enumerate_items(item_id, page_token).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(items),
            }
        }
    }

    fn schedule_upload(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> PendingOperation<ItemMetadata> {
        let workflow = self.factory.upload_workflow(item.clone(), record);
        PendingOperation::scheduled(item, self.scheduler().spawn(workflow))
    }

    async fn replace_upload_record(&self, item: &ItemMetadata) -> Result<TaskRecord, EngineError> {
        Ok(self.stores.uploads.replace_task_record(item).await?)
    }

    async fn copy_into_cache(&self, item: &ItemMetadata, source: &Path) -> Result<PathBuf, EngineError> {
        let local = cache_path_for_item(&self.cache_root, item.id, &item.name)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &local).await?;
        Ok(local)
    }

    /// Copies a local file into the cache as a new item under `parent_id` and
    /// uploads it. The name gets a collision suffix if it is taken.
    pub async fn import_document(
        &self,
        source: &Path,
        parent_id: i64,
    ) -> Result<PendingOperation<ItemMetadata>, EngineError> {
        let parent = self.require_folder(parent_id).await?;
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| PathError::InvalidName(source.display().to_string()))?;
        validate_name(name)?;
        let size = tokio::fs::metadata(source).await?.len() as i64;
        let path = free_path(&self.stores.metadata, &parent.path, name).await?;

        let placeholder = self
            .stores
            .metadata
            .insert_item(&NewItem {
                parent_id: parent.id,
                name: path.name().unwrap_or(name).to_string(),
                path,
                item_type: ItemType::File,
                size: Some(size),
                last_modified: None,
                status: ItemStatus::Uploading,
                is_placeholder: true,
            })
            .await?;
        let record = match self.cache_and_record_import(&placeholder, source).await {
            Ok(record) => record,
            Err(err) => {
                self.discard_placeholder(&placeholder).await;
                return Err(err);
            }
        };
        info!(path = %placeholder.path, source = %source.display(), "document imported");
        Ok(self.schedule_upload(placeholder, record))
    }

    async fn cache_and_record_import(
        &self,
        placeholder: &ItemMetadata,
        source: &Path,
    ) -> Result<TaskRecord, EngineError> {
        let local = self.copy_into_cache(placeholder, source).await?;
        self.stores
            .cache
            .cache_local_file_info(placeholder.id, &local, None)
            .await?;
        Ok(self.stores.uploads.create_task_record(placeholder).await?)
    }

    /// Drops a placeholder whose upload could not be queued, cached copy
    /// included.
    async fn discard_placeholder(&self, placeholder: &ItemMetadata) {
        if let Err(err) = self.stores.cache.remove_cached_file(placeholder.id).await {
            warn!(path = %placeholder.path, error = %err, "failed to remove cached copy of placeholder");
        }
        if let Err(err) = self.stores.metadata.remove_item(placeholder.id).await {
            error!(path = %placeholder.path, error = %err, "failed to roll back placeholder");
        }
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: i64,
    ) -> Result<PendingOperation<ItemMetadata>, EngineError> {
        validate_name(name)?;
        let parent = self.require_folder(parent_id).await?;
        let path = free_path(&self.stores.metadata, &parent.path, name).await?;
        let placeholder = self
            .stores
            .metadata
            .insert_item(&NewItem {
                parent_id: parent.id,
                name: path.name().unwrap_or(name).to_string(),
                path,
                item_type: ItemType::Folder,
                size: None,
                last_modified: None,
                status: ItemStatus::Uploading,
                is_placeholder: true,
            })
            .await?;
        let record = match self.stores.uploads.create_task_record(&placeholder).await {
            Ok(record) => record,
            Err(err) => {
                self.discard_placeholder(&placeholder).await;
                return Err(err.into());
            }
        };
        Ok(self.schedule_upload(placeholder, record))
    }

    /// The cached file of the item was edited by the host; upload it.
    pub async fn item_changed(
        &self,
        item_id: i64,
    ) -> Result<PendingOperation<ItemMetadata>, EngineError> {
        let item = self.require_file(item_id).await?;
        let info = self
            .stores
            .cache
            .get_local_cached_file_info(item_id)
            .await?
            .ok_or(EngineError::MissingCachedFile(item_id))?;
        let size = tokio::fs::metadata(&info.local_path).await?.len() as i64;
        self.stores
            .cache
            .cache_local_file_info(item_id, &info.local_path, None)
            .await?;
        self.stores.metadata.set_size(item_id, Some(size)).await?;
        let record = self.replace_upload_record(&item).await?;
        let item = self.require(item_id).await?;
        Ok(self.schedule_upload(item, record))
    }

    pub async fn retry_upload(
        &self,
        item_id: i64,
    ) -> Result<PendingOperation<ItemMetadata>, EngineError> {
        let item = self.require(item_id).await?;
        if self.stores.uploads.get_task_record(item_id).await?.is_none() {
            return Err(EngineError::NoPendingUpload(item_id));
        }
        let record = self.replace_upload_record(&item).await?;
        let item = self.require(item_id).await?;
        Ok(self.schedule_upload(item, record))
    }

    /// Renames and/or reparents the item locally, then moves it remotely.
    pub async fn move_item(
        &self,
        item_id: i64,
        new_parent_id: i64,
        new_name: &str,
    ) -> Result<PendingOperation<()>, EngineError> {
        let item = self.require(item_id).await?;
        let Some(old_parent_id) = item.parent_id else {
            return Err(EngineError::RootItem);
        };
        if item.is_placeholder {
            return Err(EngineError::PendingUpload(item_id));
        }
        validate_name(new_name)?;
        let parent = self.require_folder(new_parent_id).await?;
        if item.is_folder() && (parent.path == item.path || item.path.is_ancestor_of(&parent.path)) {
            return Err(EngineError::MoveIntoOwnSubtree(item.path));
        }
        if parent.path.join(new_name)? == item.path {
            return Ok(PendingOperation::settled(item));
        }

        let target = free_path(&self.stores.metadata, &parent.path, new_name).await?;
        self.stores
            .metadata
            .relocate(item_id, parent.id, &target)
            .await?;
        let record = self
            .stores
            .reparents
            .replace_task_record(item_id, &item.path, &target, old_parent_id, parent.id)
            .await?;
        info!(from = %item.path, to = %target, "item moved locally");

        let workflow = self.factory.reparent_workflow(item.item_type, record);
        let moved = self.require(item_id).await?;
        Ok(PendingOperation::scheduled(moved, self.scheduler().spawn(workflow)))
    }

    /// Removes the item and its subtree locally, including cached files and
    /// pending uploads, then deletes it remotely.
    pub async fn delete_item(&self, item_id: i64) -> Result<PendingOperation<()>, EngineError> {
        let item = self.require(item_id).await?;
        if item.parent_id.is_none() {
            return Err(EngineError::RootItem);
        }

        let mut subtree = self.stores.metadata.descendants(&item.path).await?;
        subtree.push(item.clone());
        for entry in &subtree {
            self.stores.uploads.remove_task_record(entry.id).await?;
            self.stores.cache.remove_cached_file(entry.id).await?;
        }
        let record = self.stores.deletions.replace_task_record(&item).await?;
        self.stores.metadata.remove_item(item_id).await?;
        info!(path = %item.path, items = subtree.len(), "item deleted locally");

        let workflow = self.factory.deletion_workflow(record);
        Ok(PendingOperation::scheduled(item, self.scheduler().spawn(workflow)))
    }

    /// Returns a local path holding the newest version of the file.
    ///
    /// A cached copy with pending edits is served as is. Otherwise the
    /// metadata is refreshed and, if the cached copy is outdated, the file is
    /// downloaded. Local edits that may not have reached the remote are first
    /// imported as a separate item.
    pub async fn start_providing_item(&self, item_id: i64) -> Result<PathBuf, EngineError> {
        let item = self.require_file(item_id).await?;
        let cached = match self.stores.cache.get_local_cached_file_info(item_id).await? {
            Some(info) if tokio::fs::try_exists(&info.local_path).await? => Some(info),
            _ => None,
        };
        if let Some(info) = &cached
            && (item.status == ItemStatus::Uploading || item.is_placeholder)
        {
            return Ok(info.local_path.clone());
        }

        let item = match self.refresh(&item, None).await {
            Ok(_) => self.require(item_id).await?,
            Err(err) if err.is_no_connection() && cached.is_some() => {
                warn!(path = %item.path, "remote unreachable, serving cached copy");
                return cached
                    .map(|info| info.local_path)
                    .ok_or(EngineError::MissingCachedFile(item_id));
            }
            Err(err) => return Err(err),
        };
        if let Some(info) = &cached
            && info.is_current_version(item.last_modified)
        {
            return Ok(info.local_path.clone());
        }

        let local_path = match &cached {
            Some(info) => info.local_path.clone(),
            None => cache_path_for_item(&self.cache_root, item.id, &item.name)?,
        };
        let upload = self.stores.uploads.get_task_record(item_id).await?;
        let replace_existing =
            if conflict::has_possible_versioning_conflict(upload.as_ref(), cached.as_ref()) {
                self.preserve_local_edits(&item, &local_path).await?;
                false
            } else {
                true
            };

        let record = self
            .stores
            .downloads
            .replace_task_record(&item, local_path, replace_existing)
            .await?;
        let workflow = self.factory.download_workflow(item, record);
        let info = self.scheduler().schedule(workflow).await?;
        Ok(info.local_path)
    }

    async fn preserve_local_edits(
        &self,
        item: &ItemMetadata,
        local_path: &Path,
    ) -> Result<(), EngineError> {
        let staging = self
            .cache_root
            .join(STAGING_DIR)
            .join(item.id.to_string());
        tokio::fs::create_dir_all(&staging).await?;
        let staged = staging.join(&item.name);
        tokio::fs::rename(local_path, &staged).await?;
        self.stores.uploads.remove_task_record(item.id).await?;

        let parent_id = item.parent_id.unwrap_or(ROOT_ITEM_ID);
        let imported = self.import_document(&staged, parent_id).await;
        if let Err(err) = tokio::fs::remove_dir_all(&staging).await {
            warn!(path = %staging.display(), error = %err, "failed to clean staging directory");
        }
        let imported = imported?;
        info!(
            path = %item.path,
            kept_as = %imported.item.path,
            "local edits kept as a separate item"
        );
        Ok(())
    }

    /// Evicts the cached copy. Fails while the copy has unsynced edits.
    pub async fn stop_providing_item(&self, item_id: i64) -> Result<(), EngineError> {
        self.require_file(item_id).await?;
        self.stores.cache.remove_cached_file(item_id).await?;
        Ok(())
    }

    pub async fn has_possible_versioning_conflict(&self, item_id: i64) -> Result<bool, EngineError> {
        let upload = self.stores.uploads.get_task_record(item_id).await?;
        let cached = self.stores.cache.get_local_cached_file_info(item_id).await?;
        Ok(conflict::has_possible_versioning_conflict(
            upload.as_ref(),
            cached.as_ref(),
        ))
    }

    /// Stops accepting new tasks. Fails with `StoreError::RunningTask` while
    /// any task is running or pending.
    pub async fn enable_maintenance_mode(&self) -> Result<(), EngineError> {
        Ok(self.stores.maintenance.enable_maintenance_mode().await?)
    }

    pub async fn disable_maintenance_mode(&self) -> Result<(), EngineError> {
        Ok(self.stores.maintenance.disable_maintenance_mode().await?)
    }

    pub async fn is_maintenance_mode_enabled(&self) -> Result<bool, EngineError> {
        Ok(self.stores.maintenance.is_enabled().await?)
    }

    pub async fn clear_cache(&self) -> Result<usize, EngineError> {
        Ok(self.stores.cache.clear_cache().await?)
    }

    pub async fn local_cache_size_bytes(&self) -> Result<u64, EngineError> {
        Ok(self.stores.cache.local_cache_size_bytes().await?)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
