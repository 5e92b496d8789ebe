mod cloud_path;
pub mod memory;
mod provider;

pub use cloud_path::{CloudPath, PathError, validate_name};
pub use memory::{MemoryProvider, ProviderOperation};
pub use provider::{
    CloudItem, ItemList, ItemType, ProviderError, ProviderErrorClass, RemoteProvider,
};
