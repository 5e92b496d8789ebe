use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudmirror_core::{
    CloudItem, CloudPath, ItemList, MemoryProvider, ProviderError, ProviderOperation,
    RemoteProvider,
};
use cloudmirror_sync::store::{FailureKind, ROOT_ITEM_ID};
use cloudmirror_sync::{Database, ItemStatus, SyncEngine, WorkflowScheduler};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::timeout;

fn p(raw: &str) -> CloudPath {
    CloudPath::new(raw).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Memory backend whose calls can be held open per operation.
#[derive(Default)]
struct GatedProvider {
    inner: MemoryProvider,
    gates: Mutex<HashMap<ProviderOperation, Arc<Semaphore>>>,
    started: Mutex<HashMap<ProviderOperation, usize>>,
}

impl GatedProvider {
    /// Calls of `op` block until the returned gate gets permits.
    fn close(&self, op: ProviderOperation) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(op, gate.clone());
        gate
    }

    fn started(&self, op: ProviderOperation) -> usize {
        self.started.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    async fn pass(&self, op: ProviderOperation) {
        *self.started.lock().unwrap().entry(op).or_default() += 1;
        let gate = self.gates.lock().unwrap().get(&op).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl RemoteProvider for GatedProvider {
    async fn fetch_item_metadata(&self, path: &CloudPath) -> Result<CloudItem, ProviderError> {
        self.pass(ProviderOperation::FetchMetadata).await;
        self.inner.fetch_item_metadata(path).await
    }

    async fn fetch_item_list(
        &self,
        folder: &CloudPath,
        page_token: Option<&str>,
    ) -> Result<ItemList, ProviderError> {
        self.pass(ProviderOperation::FetchList).await;
        self.inner.fetch_item_list(folder, page_token).await
    }

    async fn download_file(&self, path: &CloudPath, local: &Path) -> Result<(), ProviderError> {
        self.pass(ProviderOperation::Download).await;
        self.inner.download_file(path, local).await
    }

    async fn upload_file(
        &self,
        local: &Path,
        path: &CloudPath,
        replace_existing: bool,
    ) -> Result<CloudItem, ProviderError> {
        self.pass(ProviderOperation::Upload).await;
        self.inner.upload_file(local, path, replace_existing).await
    }

    async fn create_folder(&self, path: &CloudPath) -> Result<CloudItem, ProviderError> {
        self.pass(ProviderOperation::CreateFolder).await;
        self.inner.create_folder(path).await
    }

    async fn delete_item(&self, path: &CloudPath) -> Result<(), ProviderError> {
        self.pass(ProviderOperation::Delete).await;
        self.inner.delete_item(path).await
    }

    async fn move_item(&self, from: &CloudPath, to: &CloudPath) -> Result<(), ProviderError> {
        self.pass(ProviderOperation::Move).await;
        self.inner.move_item(from, to).await
    }
}

struct Setup {
    engine: SyncEngine,
    provider: Arc<GatedProvider>,
    _cache: TempDir,
}

async fn setup() -> Setup {
    let db = Database::in_memory().await.unwrap();
    let provider = Arc::new(GatedProvider::default());
    let cache = tempfile::tempdir().unwrap();
    let engine = SyncEngine::with_scheduler(
        &db,
        provider.clone(),
        cache.path().to_path_buf(),
        WorkflowScheduler::new(1, 2),
    );
    Setup {
        engine,
        provider,
        _cache: cache,
    }
}

impl Setup {
    async fn id_of(&self, path: &str) -> i64 {
        self.engine
            .enumerate_items_extensively(ROOT_ITEM_ID)
            .await
            .unwrap();
        self.engine
            .item_for_path(&p(path))
            .await
            .unwrap()
            .unwrap()
            .id()
    }
}

#[tokio::test]
async fn listing_root_does_not_block_creating_a_child() {
    let s = setup().await;
    let gate = s.provider.close(ProviderOperation::FetchList);

    let engine = s.engine.clone();
    let listing = tokio::spawn(async move { engine.enumerate_items(ROOT_ITEM_ID, None).await });
    eventually(|| s.provider.started(ProviderOperation::FetchList) == 1).await;

    let created = s.engine.create_folder("A", ROOT_ITEM_ID).await.unwrap();
    let folder = timeout(Duration::from_secs(5), created.finished())
        .await
        .expect("folder creation waited for the listing")
        .unwrap()
        .unwrap();
    assert!(!folder.is_placeholder);
    assert!(s.provider.inner.contains(&p("/A")).await);
    assert!(!listing.is_finished());

    gate.add_permits(1);
    let listed = timeout(Duration::from_secs(5), listing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(listed.items.iter().any(|item| item.metadata.path == p("/A")));
}

#[tokio::test]
async fn move_waits_for_download_of_the_same_file() {
    let s = setup().await;
    s.provider.inner.insert_folder(&p("/a")).await;
    s.provider.inner.insert_file(&p("/a/b"), b"payload").await;
    let folder = s.id_of("/a").await;
    let file = s.id_of("/a/b").await;

    let gate = s.provider.close(ProviderOperation::Download);
    let engine = s.engine.clone();
    let providing = tokio::spawn(async move { engine.start_providing_item(file).await });
    eventually(|| s.provider.started(ProviderOperation::Download) == 1).await;

    let moved = s.engine.move_item(file, folder, "c").await.unwrap();
    assert_eq!(moved.item.path, p("/a/c"));
    let moving = tokio::spawn(moved.finished());
    let graph = s.engine.lock_graph().clone();
    eventually(|| graph.queued(&p("/a/b")) == 1).await;
    assert_eq!(s.provider.started(ProviderOperation::Move), 0);
    assert!(!moving.is_finished());

    gate.add_permits(1);
    let local = timeout(Duration::from_secs(5), providing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), moving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(tokio::fs::read(local).await.unwrap(), b"payload");
    assert!(s.provider.inner.contains(&p("/a/c")).await);
    assert!(!s.provider.inner.contains(&p("/a/b")).await);
    eventually(|| graph.is_empty()).await;
}

#[tokio::test]
async fn swapped_moves_both_complete() {
    let s = setup().await;
    s.provider.inner.insert_folder(&p("/a")).await;
    s.provider.inner.insert_folder(&p("/b")).await;
    let a = s.id_of("/a").await;
    let b = s.id_of("/b").await;

    let first = s.engine.move_item(a, ROOT_ITEM_ID, "b").await.unwrap();
    let second = s.engine.move_item(b, ROOT_ITEM_ID, "a").await.unwrap();
    assert!(first.item.name.starts_with("b ("));
    assert_eq!(second.item.path, p("/a"));

    timeout(Duration::from_secs(5), async {
        first.finished().await.unwrap();
        second.finished().await.unwrap();
    })
    .await
    .expect("swapped moves deadlocked");

    let renamed = s.engine.item(a).await.unwrap();
    assert!(s.provider.inner.contains(&renamed.metadata.path).await);
    assert!(s.provider.inner.contains(&p("/a")).await);
    assert!(!s.provider.inner.contains(&p("/b")).await);
    assert!(s.engine.lock_graph().is_empty());
}

#[tokio::test]
async fn quota_failure_marks_item_and_keeps_record() {
    let s = setup().await;
    let scratch = tempfile::tempdir().unwrap();
    let source = scratch.path().join("big.bin");
    tokio::fs::write(&source, b"too large").await.unwrap();

    s.provider
        .inner
        .fail_next(ProviderOperation::Upload, ProviderError::QuotaExceeded)
        .await;
    let pending = s.engine.import_document(&source, ROOT_ITEM_ID).await.unwrap();
    let id = pending.item.id;
    assert!(pending.finished().await.is_err());

    let item = s.engine.item(id).await.unwrap();
    assert_eq!(item.metadata.status, ItemStatus::UploadError);
    assert!(item.upload_pending);
    let record = s
        .engine
        .stores()
        .uploads
        .get_task_record(id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.last_failure_at.is_some());
    assert_eq!(record.failure_kind, Some(FailureKind::QuotaExceeded));
    assert!(s.engine.has_possible_versioning_conflict(id).await.unwrap());
    assert!(!s.provider.inner.contains(&p("/big.bin")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_listings_of_one_folder_both_succeed() {
    let s = setup().await;
    s.provider.inner.insert_file(&p("/a.txt"), b"a").await;
    s.provider.inner.insert_folder(&p("/b")).await;

    for _ in 0..50 {
        let (one, two) = tokio::join!(
            s.engine.enumerate_items(ROOT_ITEM_ID, None),
            s.engine.enumerate_items(ROOT_ITEM_ID, None),
        );
        assert_eq!(one.unwrap().items.len(), 2);
        assert_eq!(two.unwrap().items.len(), 2);
    }
    let records = s.engine.stores().enumerations.get_task_record(ROOT_ITEM_ID).await;
    assert!(records.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_downloads_of_one_file_both_succeed() {
    let s = setup().await;
    s.provider.inner.insert_file(&p("/a.txt"), b"payload").await;
    let file = s.id_of("/a.txt").await;

    for _ in 0..20 {
        s.engine.stop_providing_item(file).await.unwrap();
        let (one, two) = tokio::join!(
            s.engine.start_providing_item(file),
            s.engine.start_providing_item(file),
        );
        let (one, two) = (one.unwrap(), two.unwrap());
        assert_eq!(one, two);
        assert_eq!(tokio::fs::read(&one).await.unwrap(), b"payload");
    }
    let item = s.engine.item(file).await.unwrap();
    assert!(item.newest_version_locally_cached);
    eventually(|| s.engine.lock_graph().is_empty()).await;
}
