use std::path::{Path, PathBuf};

use cloudmirror_core::{PathError, validate_name};

/// Local cache location of an item: one directory per item id, holding the
/// file under its remote name.
pub fn cache_path_for_item(cache_root: &Path, item_id: i64, name: &str) -> Result<PathBuf, PathError> {
    validate_name(name)?;
    // Item names are single components; a backslash would nest on Windows.
    if name.contains('\\') {
        return Err(PathError::InvalidName(name.to_string()));
    }
    let mut out = cache_root.to_path_buf();
    out.push(item_id.to_string());
    out.push(name);
    Ok(out)
}
