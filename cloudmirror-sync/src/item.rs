use std::path::PathBuf;

use crate::store::{FailureKind, ItemMetadata};

/// An item as the host sees it: stored metadata plus the state of its local
/// copy and any pending upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidedItem {
    pub metadata: ItemMetadata,
    pub local_path: Option<PathBuf>,
    pub newest_version_locally_cached: bool,
    pub upload_pending: bool,
    pub upload_failure: Option<FailureKind>,
}

impl ProvidedItem {
    pub fn id(&self) -> i64 {
        self.metadata.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvidedItemList {
    pub items: Vec<ProvidedItem>,
    pub next_page_token: Option<String>,
}

impl ProvidedItemList {
    pub fn is_complete(&self) -> bool {
        self.next_page_token.is_none()
    }
}
