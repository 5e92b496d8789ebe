use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud_path::CloudPath;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("item not found: {0}")]
    NotFound(CloudPath),
    #[error("item already exists: {0}")]
    AlreadyExists(CloudPath),
    #[error("remote storage quota exceeded")]
    QuotaExceeded,
    #[error("not authorized against remote storage")]
    Unauthorized,
    #[error("no connection to remote storage")]
    NoConnection,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote storage error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorClass {
    Auth,
    Transient,
    Permanent,
}

impl ProviderError {
    pub fn class(&self) -> ProviderErrorClass {
        match self {
            ProviderError::Unauthorized => ProviderErrorClass::Auth,
            ProviderError::NoConnection => ProviderErrorClass::Transient,
            _ => ProviderErrorClass::Permanent,
        }
    }

    /// Hint for host retry policies; the sync core itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.class() == ProviderErrorClass::Transient
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudItem {
    pub path: CloudPath,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub size: Option<u64>,
    /// Unix timestamp in nanoseconds.
    #[serde(default)]
    pub last_modified: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ItemList {
    pub items: Vec<CloudItem>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Remote storage backend consumed by the sync core.
///
/// `delete_item` is recursive for folders. `upload_file` with
/// `replace_existing == false` must fail with `AlreadyExists` when the target
/// is occupied.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    async fn fetch_item_metadata(&self, path: &CloudPath) -> Result<CloudItem, ProviderError>;

    async fn fetch_item_list(
        &self,
        folder: &CloudPath,
        page_token: Option<&str>,
    ) -> Result<ItemList, ProviderError>;

    async fn download_file(&self, path: &CloudPath, local: &Path) -> Result<(), ProviderError>;

    async fn upload_file(
        &self,
        local: &Path,
        path: &CloudPath,
        replace_existing: bool,
    ) -> Result<CloudItem, ProviderError>;

    async fn create_folder(&self, path: &CloudPath) -> Result<CloudItem, ProviderError>;

    async fn delete_item(&self, path: &CloudPath) -> Result<(), ProviderError>;

    async fn move_item(&self, from: &CloudPath, to: &CloudPath) -> Result<(), ProviderError>;
}
