use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::cloud_path::CloudPath;
use crate::provider::{CloudItem, ItemList, ItemType, ProviderError, RemoteProvider};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    FetchMetadata,
    FetchList,
    Download,
    Upload,
    CreateFolder,
    Delete,
    Move,
}

#[derive(Debug, Clone)]
struct Entry {
    item_type: ItemType,
    data: Vec<u8>,
    modified: i64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<CloudPath, Entry>,
    failures: HashMap<ProviderOperation, VecDeque<ProviderError>>,
    calls: HashMap<ProviderOperation, usize>,
    last_stamp: i64,
}

impl State {
    fn begin(&mut self, op: ProviderOperation) -> Result<(), ProviderError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stamp(&mut self) -> i64 {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn require_folder(&self, path: &CloudPath) -> Result<(), ProviderError> {
        match self.entries.get(path) {
            Some(entry) if entry.item_type == ItemType::Folder => Ok(()),
            _ => Err(ProviderError::NotFound(path.clone())),
        }
    }

    fn require_parent(&self, path: &CloudPath) -> Result<(), ProviderError> {
        let parent = path
            .parent()
            .ok_or_else(|| ProviderError::AlreadyExists(path.clone()))?;
        self.require_folder(&parent)
    }

    fn subtree(&self, root: &CloudPath) -> Vec<CloudPath> {
        self.entries
            .range(root.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| *path == root || root.is_ancestor_of(path))
            .cloned()
            .collect()
    }

    fn item(&self, path: &CloudPath) -> Result<CloudItem, ProviderError> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| ProviderError::NotFound(path.clone()))?;
        Ok(to_cloud_item(path, entry))
    }
}

/// Remote provider that keeps the whole namespace in process memory.
///
/// Listings are paginated with an opaque numeric page token. Failures can be
/// queued per operation with [`MemoryProvider::fail_next`].
#[derive(Debug)]
pub struct MemoryProvider {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let mut state = State::default();
        let modified = state.stamp();
        state.entries.insert(
            CloudPath::root(),
            Entry {
                item_type: ItemType::Folder,
                data: Vec::new(),
                modified,
            },
        );
        Self {
            state: Mutex::new(state),
            page_size: page_size.max(1),
        }
    }

    pub async fn insert_folder(&self, path: &CloudPath) {
        let mut state = self.state.lock().await;
        let modified = state.stamp();
        for ancestor in path.ancestors().into_iter().chain([path.clone()]) {
            state.entries.entry(ancestor).or_insert_with(|| Entry {
                item_type: ItemType::Folder,
                data: Vec::new(),
                modified,
            });
        }
    }

    pub async fn insert_file(&self, path: &CloudPath, data: &[u8]) -> CloudItem {
        if let Some(parent) = path.parent() {
            self.insert_folder(&parent).await;
        }
        let mut state = self.state.lock().await;
        let entry = Entry {
            item_type: ItemType::File,
            data: data.to_vec(),
            modified: state.stamp(),
        };
        let item = to_cloud_item(path, &entry);
        state.entries.insert(path.clone(), entry);
        item
    }

    pub async fn contains(&self, path: &CloudPath) -> bool {
        self.state.lock().await.entries.contains_key(path)
    }

    pub async fn file_contents(&self, path: &CloudPath) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .entries
            .get(path)
            .filter(|entry| entry.item_type == ItemType::File)
            .map(|entry| entry.data.clone())
    }

    pub async fn fail_next(&self, op: ProviderOperation, err: ProviderError) {
        let mut state = self.state.lock().await;
        state.failures.entry(op).or_default().push_back(err);
    }

    pub async fn call_count(&self, op: ProviderOperation) -> usize {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or_default()
    }
}

#[async_trait]
impl RemoteProvider for MemoryProvider {
    async fn fetch_item_metadata(&self, path: &CloudPath) -> Result<CloudItem, ProviderError> {
        let mut state = self.state.lock().await;
        state.begin(ProviderOperation::FetchMetadata)?;
        state.item(path)
    }

    async fn fetch_item_list(
        &self,
        folder: &CloudPath,
        page_token: Option<&str>,
    ) -> Result<ItemList, ProviderError> {
        let mut state = self.state.lock().await;
        state.begin(ProviderOperation::FetchList)?;
        state.require_folder(folder)?;

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::Other(format!("invalid page token: {token}")))?,
            None => 0,
        };
        let children: Vec<CloudItem> = state
            .entries
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(folder))
            .map(|(path, entry)| to_cloud_item(path, entry))
            .collect();
        let end = offset.saturating_add(self.page_size).min(children.len());
        let items = children.get(offset..end).unwrap_or_default().to_vec();
        let next_page_token = (end < children.len()).then(|| end.to_string());
        Ok(ItemList {
            items,
            next_page_token,
        })
    }

    async fn download_file(&self, path: &CloudPath, local: &Path) -> Result<(), ProviderError> {
        let data = {
            let mut state = self.state.lock().await;
            state.begin(ProviderOperation::Download)?;
            match state.entries.get(path) {
                Some(entry) if entry.item_type == ItemType::File => entry.data.clone(),
                _ => return Err(ProviderError::NotFound(path.clone())),
            }
        };
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        local: &Path,
        path: &CloudPath,
        replace_existing: bool,
    ) -> Result<CloudItem, ProviderError> {
        {
            let mut state = self.state.lock().await;
            state.begin(ProviderOperation::Upload)?;
        }
        let data = tokio::fs::read(local).await?;

        let mut state = self.state.lock().await;
        state.require_parent(path)?;
        match state.entries.get(path) {
            Some(existing) if existing.item_type == ItemType::Folder || !replace_existing => {
                return Err(ProviderError::AlreadyExists(path.clone()));
            }
            _ => {}
        }
        let entry = Entry {
            item_type: ItemType::File,
            data,
            modified: state.stamp(),
        };
        let item = to_cloud_item(path, &entry);
        state.entries.insert(path.clone(), entry);
        Ok(item)
    }

    async fn create_folder(&self, path: &CloudPath) -> Result<CloudItem, ProviderError> {
        let mut state = self.state.lock().await;
        state.begin(ProviderOperation::CreateFolder)?;
        state.require_parent(path)?;
        if state.entries.contains_key(path) {
            return Err(ProviderError::AlreadyExists(path.clone()));
        }
        let entry = Entry {
            item_type: ItemType::Folder,
            data: Vec::new(),
            modified: state.stamp(),
        };
        let item = to_cloud_item(path, &entry);
        state.entries.insert(path.clone(), entry);
        Ok(item)
    }

    async fn delete_item(&self, path: &CloudPath) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.begin(ProviderOperation::Delete)?;
        if path.is_root() {
            return Err(ProviderError::Other("refusing to delete the root folder".into()));
        }
        if !state.entries.contains_key(path) {
            return Err(ProviderError::NotFound(path.clone()));
        }
        for doomed in state.subtree(path) {
            state.entries.remove(&doomed);
        }
        Ok(())
    }

    async fn move_item(&self, from: &CloudPath, to: &CloudPath) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.begin(ProviderOperation::Move)?;
        if !state.entries.contains_key(from) {
            return Err(ProviderError::NotFound(from.clone()));
        }
        if state.entries.contains_key(to) {
            return Err(ProviderError::AlreadyExists(to.clone()));
        }
        if from.is_ancestor_of(to) {
            return Err(ProviderError::Other(format!(
                "cannot move {from} into its own subtree"
            )));
        }
        state.require_parent(to)?;
        for old in state.subtree(from) {
            if let (Some(entry), Some(new)) = (state.entries.remove(&old), old.rebase(from, to)) {
                state.entries.insert(new, entry);
            }
        }
        Ok(())
    }
}

fn to_cloud_item(path: &CloudPath, entry: &Entry) -> CloudItem {
    CloudItem {
        path: path.clone(),
        name: path.name().unwrap_or("/").to_string(),
        item_type: entry.item_type,
        size: match entry.item_type {
            ItemType::File => Some(entry.data.len() as u64),
            ItemType::Folder => None,
        },
        last_modified: Some(entry.modified),
    }
}
