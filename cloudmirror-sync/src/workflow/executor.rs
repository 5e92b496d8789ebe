use std::collections::HashSet;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudmirror_core::{CloudItem, CloudPath, ItemType, ProviderError, RemoteProvider};
use tracing::{debug, error, info, warn};

use crate::conflict::free_collision_path;
use crate::error::EngineError;
use crate::paths::cache_path_for_item;
use crate::store::{
    ItemMetadata, ItemStatus, LocalCachedFileInfo, ROOT_ITEM_ID, StoreError, Stores, TaskDetails,
    TaskKind, TaskRecord,
};

/// One page of an enumeration as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataPage {
    pub items: Vec<ItemMetadata>,
    pub next_page_token: Option<String>,
}

/// Result of an upload or folder creation.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Uploaded(ItemMetadata),
    /// The remote name was taken; the placeholder moved to a collision path
    /// and needs a fresh upload under the new record.
    Relocated(ItemMetadata, TaskRecord),
}

/// Performs the remote call of each task kind and writes the result back
/// into the stores. Callers hold the task's locks while these run.
#[derive(Clone)]
pub struct TaskExecutor {
    provider: Arc<dyn RemoteProvider>,
    stores: Stores,
    cache_root: PathBuf,
}

impl TaskExecutor {
    pub fn new(provider: Arc<dyn RemoteProvider>, stores: Stores, cache_root: PathBuf) -> Self {
        Self {
            provider,
            stores,
            cache_root,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    async fn note_failure(&self, item_id: i64, kind: TaskKind, err: &EngineError) {
        let failure = err.failure_kind();
        if let Err(store_err) = self.stores.tasks.record_failure(item_id, kind, failure).await {
            error!(item_id, %kind, error = %store_err, "failed to record task failure");
        }
    }

    pub async fn enumerate(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> Result<MetadataPage, EngineError> {
        let page_token = match &record.details {
            TaskDetails::Enumeration { page_token } => page_token.clone(),
            _ => None,
        };
        let result = match item.item_type {
            ItemType::Folder => self.enumerate_folder(&item, page_token.as_deref()).await,
            ItemType::File => self.refresh_file(&item).await.map(|refreshed| MetadataPage {
                items: vec![refreshed],
                next_page_token: None,
            }),
        };
        self.stores.enumerations.complete_task_record(&record).await?;
        result
    }

    async fn refresh_file(&self, item: &ItemMetadata) -> Result<ItemMetadata, EngineError> {
        let remote = self.provider.fetch_item_metadata(&item.path).await?;
        let parent_id = item.parent_id.unwrap_or(ROOT_ITEM_ID);
        Ok(self.stores.metadata.cache_remote_item(parent_id, &remote).await?)
    }

    async fn enumerate_folder(
        &self,
        folder: &ItemMetadata,
        page_token: Option<&str>,
    ) -> Result<MetadataPage, EngineError> {
        let metadata = &self.stores.metadata;
        if page_token.is_none() {
            let flagged = metadata.flag_children_maybe_outdated(folder.id).await?;
            debug!(path = %folder.path, flagged, "listing started");
        }
        let listing = self
            .provider
            .fetch_item_list(&folder.path, page_token)
            .await?;

        let mut hidden: HashSet<CloudPath> = HashSet::new();
        for record in self.stores.deletions.records_which_were_in(folder.id).await? {
            hidden.insert(record.target_path);
        }
        for record in self.stores.reparents.records_which_were_in(folder.id).await? {
            if let TaskDetails::Reparent { source_path, .. } = record.details {
                hidden.insert(source_path);
            }
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(listing.items.len());
        for remote in &listing.items {
            if hidden.contains(&remote.path) {
                debug!(path = %remote.path, "skipping item with pending local change");
                continue;
            }
            let cached = metadata.cache_remote_item(folder.id, remote).await?;
            if seen.insert(cached.id) {
                items.push(cached);
            }
        }

        let arriving: Vec<i64> = self
            .stores
            .reparents
            .records_which_are_soon_in(folder.id)
            .await?
            .into_iter()
            .map(|record| record.item_id)
            .collect();
        for item in metadata.items(&arriving).await? {
            if seen.insert(item.id) {
                items.push(item);
            }
        }
        for placeholder in metadata.placeholders(folder.id).await? {
            if seen.insert(placeholder.id) {
                items.push(placeholder);
            }
        }

        if listing.next_page_token.is_none() {
            let arriving: HashSet<i64> = arriving.into_iter().collect();
            for stale in metadata.maybe_outdated_children(folder.id).await? {
                if arriving.contains(&stale.id) {
                    continue;
                }
                if self.remove_local_subtree(&stale).await? {
                    items.retain(|item| item.id != stale.id);
                }
            }
        }

        Ok(MetadataPage {
            items,
            next_page_token: listing.next_page_token,
        })
    }

    /// Drops an item that vanished remotely, together with its subtree and
    /// cached files. Returns false and keeps everything when any item in the
    /// subtree still has edits waiting to be uploaded.
    pub async fn remove_local_subtree(&self, item: &ItemMetadata) -> Result<bool, EngineError> {
        let mut subtree = self.stores.metadata.descendants(&item.path).await?;
        subtree.push(item.clone());
        let ids: Vec<i64> = subtree.iter().map(|entry| entry.id).collect();
        let uploads = self.stores.uploads.get_task_records(&ids).await?;
        if let Some(record) = uploads.into_iter().flatten().next() {
            warn!(
                path = %item.path,
                pending = %record.target_path,
                "item is gone remotely but has unsynced edits, keeping it"
            );
            return Ok(false);
        }
        for entry in &subtree {
            self.stores.cache.remove_cached_file(entry.id).await?;
        }
        self.stores.metadata.remove_item(item.id).await?;
        info!(path = %item.path, "removed item missing from remote listing");
        Ok(true)
    }

    pub async fn download(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> Result<LocalCachedFileInfo, EngineError> {
        let TaskDetails::Download {
            local_path,
            replace_existing,
        } = &record.details
        else {
            return Err(StoreError::IncompleteTask("local_path").into());
        };

        match self.fetch_into_cache(&item, &record, local_path, *replace_existing).await {
            Ok(info) => {
                self.stores.downloads.complete_task_record(&record).await?;
                self.stores
                    .metadata
                    .set_status(item.id, ItemStatus::Uploaded)
                    .await?;
                Ok(info)
            }
            Err(err) => {
                self.note_failure(item.id, TaskKind::Download, &err).await;
                Err(err)
            }
        }
    }

    async fn fetch_into_cache(
        &self,
        item: &ItemMetadata,
        record: &TaskRecord,
        target: &Path,
        replace_existing: bool,
    ) -> Result<LocalCachedFileInfo, EngineError> {
        if !replace_existing && tokio::fs::try_exists(target).await? {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already exists", target.display()),
            )
            .into());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target, record.created_at);
        if let Err(err) = self.provider.download_file(&item.path, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.into());
        }
        tokio::fs::rename(&partial, target).await?;
        Ok(self
            .stores
            .cache
            .cache_local_file_info(item.id, target, item.last_modified)
            .await?)
    }

    /// Uploads a file or creates a folder, depending on the item type.
    pub async fn upload(
        &self,
        item: ItemMetadata,
        record: TaskRecord,
    ) -> Result<UploadOutcome, EngineError> {
        let result = match item.item_type {
            ItemType::File => self.upload_file(&item, &record).await,
            ItemType::Folder => self.create_folder(&item, &record).await,
        };
        match result {
            Ok(uploaded) => Ok(UploadOutcome::Uploaded(uploaded)),
            Err(err) if err.is_already_exists() && item.is_placeholder => {
                match self.relocate_colliding_placeholder(&item, &record).await {
                    Ok((moved, record)) => {
                        info!(from = %item.path, to = %moved.path, "remote name taken, placeholder moved");
                        Ok(UploadOutcome::Relocated(moved, record))
                    }
                    Err(relocate_err) => {
                        self.note_failure(item.id, TaskKind::Upload, &relocate_err).await;
                        Err(relocate_err)
                    }
                }
            }
            Err(err) => {
                self.note_failure(item.id, TaskKind::Upload, &err).await;
                Err(err)
            }
        }
    }

    async fn upload_file(
        &self,
        item: &ItemMetadata,
        record: &TaskRecord,
    ) -> Result<ItemMetadata, EngineError> {
        let info = self
            .stores
            .cache
            .get_local_cached_file_info(item.id)
            .await?
            .ok_or(EngineError::MissingCachedFile(item.id))?;
        let local_size = tokio::fs::metadata(&info.local_path).await?.len();
        let remote = self
            .provider
            .upload_file(&info.local_path, &item.path, !item.is_placeholder)
            .await?;
        if remote.item_type != ItemType::File {
            return Err(EngineError::InconsistentItem(item.path.clone()));
        }

        let Some(uploaded) = self.finish_upload(item, record, &remote).await? else {
            return self.stores.metadata.require_item(item.id).await.map_err(Into::into);
        };
        if remote.size == Some(local_size) {
            self.stores
                .cache
                .cache_local_file_info(item.id, &info.local_path, remote.last_modified)
                .await?;
        } else {
            warn!(
                path = %item.path,
                local_size,
                remote_size = ?remote.size,
                "uploaded size differs, dropping cached copy"
            );
            if let Err(err) = self.stores.cache.remove_cached_file(item.id).await {
                warn!(path = %item.path, error = %err, "failed to drop cached copy");
            }
        }
        Ok(uploaded)
    }

    async fn create_folder(
        &self,
        item: &ItemMetadata,
        record: &TaskRecord,
    ) -> Result<ItemMetadata, EngineError> {
        let remote = self.provider.create_folder(&item.path).await?;
        if remote.item_type != ItemType::Folder {
            return Err(EngineError::InconsistentItem(item.path.clone()));
        }
        match self.finish_upload(item, record, &remote).await? {
            Some(uploaded) => Ok(uploaded),
            None => Ok(self.stores.metadata.require_item(item.id).await?),
        }
    }

    /// Applies the remote metadata and clears the record. Returns `None`
    /// when a newer upload of the item was requested meanwhile; the item then
    /// stays in the uploading state for that upload.
    async fn finish_upload(
        &self,
        item: &ItemMetadata,
        record: &TaskRecord,
        remote: &CloudItem,
    ) -> Result<Option<ItemMetadata>, EngineError> {
        let uploaded = self.stores.metadata.mark_uploaded(item.id, remote).await?;
        if self.stores.uploads.complete_task_record(record).await? {
            return Ok(Some(uploaded));
        }
        debug!(path = %item.path, "upload superseded by a newer one");
        self.stores
            .metadata
            .set_status(item.id, ItemStatus::Uploading)
            .await?;
        Ok(None)
    }

    async fn relocate_colliding_placeholder(
        &self,
        item: &ItemMetadata,
        record: &TaskRecord,
    ) -> Result<(ItemMetadata, TaskRecord), EngineError> {
        let parent_path = item.path.parent().ok_or(EngineError::RootItem)?;
        let parent_id = item.parent_id.unwrap_or(ROOT_ITEM_ID);
        let target = free_collision_path(&self.stores.metadata, &parent_path, &item.name).await?;
        let moved = self
            .stores
            .metadata
            .relocate(item.id, parent_id, &target)
            .await?;

        if let Some(info) = self.stores.cache.get_local_cached_file_info(item.id).await? {
            let relocated = cache_path_for_item(&self.cache_root, item.id, &moved.name)?;
            tokio::fs::rename(&info.local_path, &relocated).await?;
            self.stores
                .cache
                .cache_local_file_info(item.id, &relocated, info.remote_last_modified)
                .await?;
        }

        let record = self.stores.uploads.replace_task_record(&moved).await?;
        Ok((moved, record))
    }

    pub async fn delete(&self, record: TaskRecord) -> Result<(), EngineError> {
        let TaskDetails::Deletion { subtree_path, .. } = &record.details else {
            return Err(StoreError::IncompleteTask("subtree_path").into());
        };
        match self.provider.delete_item(subtree_path).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                debug!(path = %subtree_path, "already gone remotely");
            }
            Err(err) => {
                let err = EngineError::from(err);
                self.note_failure(record.item_id, TaskKind::Deletion, &err).await;
                return Err(err);
            }
        }
        self.stores.deletions.complete_task_record(&record).await?;
        Ok(())
    }

    pub async fn reparent(&self, record: TaskRecord) -> Result<(), EngineError> {
        let TaskDetails::Reparent {
            source_path,
            target_path,
            ..
        } = &record.details
        else {
            return Err(StoreError::IncompleteTask("source_path").into());
        };
        if let Err(err) = self.provider.move_item(source_path, target_path).await {
            let err = EngineError::from(err);
            self.note_failure(record.item_id, TaskKind::Reparent, &err).await;
            return Err(err);
        }

        let completed = self.stores.reparents.complete_task_record(&record).await?;
        let upload_pending = self
            .stores
            .uploads
            .get_task_record(record.item_id)
            .await?
            .is_some();
        if completed && !upload_pending {
            match self
                .stores
                .metadata
                .set_status(record.item_id, ItemStatus::Uploaded)
                .await
            {
                Ok(()) | Err(StoreError::MissingItem(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Per-record download file next to the target, so overlapping downloads of
/// one item never share it.
fn partial_path(target: &Path, stamp: i64) -> PathBuf {
    let mut name = target.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{stamp:x}.partial"));
    target.with_file_name(name)
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
