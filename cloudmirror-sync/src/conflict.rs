use cloudmirror_core::CloudPath;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::EngineError;
use crate::store::{LocalCachedFileInfo, MetadataStore, TaskRecord};

const SUFFIX_LEN: usize = 5;
const MAX_COLLISION_ATTEMPTS: usize = 16;

/// True when the local copy may hold edits the remote has not seen.
///
/// A pending upload that never failed is always a possible conflict. After a
/// failure, only edits made before the failure are at risk; a cache write
/// newer than the failure means the user already reconciled.
pub fn has_possible_versioning_conflict(
    upload: Option<&TaskRecord>,
    cached: Option<&LocalCachedFileInfo>,
) -> bool {
    let (Some(upload), Some(cached)) = (upload, cached) else {
        return false;
    };
    match upload.last_failure_at {
        None => true,
        Some(failed_at) => failed_at > cached.local_last_modified,
    }
}

/// `report.pdf` with suffix `a1B2c` becomes `report (a1B2c).pdf`.
pub fn with_collision_suffix(name: &str, suffix: &str) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} ({suffix}).{ext}");
    }
    format!("{name} ({suffix})")
}

pub fn collision_name(name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    with_collision_suffix(name, &suffix)
}

/// First unoccupied path for `name` under `parent`, trying the plain name and
/// then randomized collision names.
pub async fn free_path(
    metadata: &MetadataStore,
    parent: &CloudPath,
    name: &str,
) -> Result<CloudPath, EngineError> {
    let wanted = parent.join(name)?;
    if metadata.item_for_path(&wanted).await?.is_none() {
        return Ok(wanted);
    }
    for _ in 0..MAX_COLLISION_ATTEMPTS {
        let candidate = parent.join(&collision_name(name))?;
        if metadata.item_for_path(&candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(EngineError::NameCollision(wanted))
}

/// Like [`free_path`] but never returns the plain name.
pub async fn free_collision_path(
    metadata: &MetadataStore,
    parent: &CloudPath,
    name: &str,
) -> Result<CloudPath, EngineError> {
    for _ in 0..MAX_COLLISION_ATTEMPTS {
        let candidate = parent.join(&collision_name(name))?;
        if metadata.item_for_path(&candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(EngineError::NameCollision(parent.join(name)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, ItemStatus, NewItem, ROOT_ITEM_ID, TaskDetails};
    use cloudmirror_core::ItemType;
    use std::path::PathBuf;

    fn upload(failed_at: Option<i64>) -> TaskRecord {
        TaskRecord {
            item_id: 2,
            target_path: CloudPath::new("/a.txt").unwrap(),
            created_at: 10,
            last_failure_at: failed_at,
            failure_kind: None,
            details: TaskDetails::Upload,
        }
    }

    fn cached(local_last_modified: i64) -> LocalCachedFileInfo {
        LocalCachedFileInfo {
            item_id: 2,
            local_path: PathBuf::from("/cache/2/a.txt"),
            remote_last_modified: None,
            local_last_modified,
        }
    }

    #[test]
    fn no_conflict_without_upload_or_cache() {
        assert!(!has_possible_versioning_conflict(None, Some(&cached(5))));
        assert!(!has_possible_versioning_conflict(Some(&upload(None)), None));
    }

    #[test]
    fn unfinished_upload_is_a_conflict() {
        assert!(has_possible_versioning_conflict(
            Some(&upload(None)),
            Some(&cached(5))
        ));
    }

    #[test]
    fn failure_after_last_local_write_is_a_conflict() {
        assert!(has_possible_versioning_conflict(
            Some(&upload(Some(20))),
            Some(&cached(15))
        ));
        assert!(!has_possible_versioning_conflict(
            Some(&upload(Some(20))),
            Some(&cached(25))
        ));
    }

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(with_collision_suffix("report.pdf", "a1B2c"), "report (a1B2c).pdf");
        assert_eq!(with_collision_suffix("Makefile", "a1B2c"), "Makefile (a1B2c)");
        assert_eq!(with_collision_suffix(".bashrc", "a1B2c"), ".bashrc (a1B2c)");
        assert_eq!(
            with_collision_suffix("archive.tar.gz", "x"),
            "archive.tar (x).gz"
        );
    }

    #[test]
    fn random_collision_names_differ_from_original() {
        let renamed = collision_name("report.pdf");
        assert_ne!(renamed, "report.pdf");
        assert!(renamed.starts_with("report ("));
        assert!(renamed.ends_with(").pdf"));
        assert_eq!(renamed.len(), "report ().pdf".len() + SUFFIX_LEN);
    }

    #[tokio::test]
    async fn free_path_skips_occupied_name() {
        let db = Database::in_memory().await.unwrap();
        let metadata = MetadataStore::new(&db);
        let root = CloudPath::root();
        assert_eq!(
            free_path(&metadata, &root, "a.txt").await.unwrap().as_str(),
            "/a.txt"
        );

        metadata
            .insert_item(&NewItem {
                parent_id: ROOT_ITEM_ID,
                name: "a.txt".into(),
                path: CloudPath::new("/a.txt").unwrap(),
                item_type: ItemType::File,
                size: None,
                last_modified: None,
                status: ItemStatus::Uploaded,
                is_placeholder: false,
            })
            .await
            .unwrap();
        let free = free_path(&metadata, &root, "a.txt").await.unwrap();
        assert_ne!(free.as_str(), "/a.txt");
        assert!(free.name().unwrap().starts_with("a ("));
    }
}
