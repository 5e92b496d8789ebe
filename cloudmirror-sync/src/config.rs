use std::path::PathBuf;

pub const DB_PATH_ENV: &str = "CLOUDMIRROR_DB_PATH";
pub const CACHE_DIR_ENV: &str = "CLOUDMIRROR_CACHE_DIR";
pub const MAX_PARALLEL_UPLOADS_ENV: &str = "CLOUDMIRROR_MAX_PARALLEL_UPLOADS";
pub const MAX_PARALLEL_DOWNLOADS_ENV: &str = "CLOUDMIRROR_MAX_PARALLEL_DOWNLOADS";

const DEFAULT_PARALLEL_UPLOADS: usize = 1;
const DEFAULT_PARALLEL_DOWNLOADS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub max_parallel_uploads: usize,
    pub max_parallel_downloads: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_dir: default_cache_root(),
            max_parallel_uploads: DEFAULT_PARALLEL_UPLOADS,
            max_parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Unset, empty,
    /// zero or unparsable limits fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path_var = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        };
        let limit_var = |name: &str, default: usize| {
            lookup(name)
                .and_then(|value| value.trim().parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };
        Self {
            db_path: path_var(DB_PATH_ENV).unwrap_or_else(default_db_path),
            cache_dir: path_var(CACHE_DIR_ENV).unwrap_or_else(default_cache_root),
            max_parallel_uploads: limit_var(MAX_PARALLEL_UPLOADS_ENV, DEFAULT_PARALLEL_UPLOADS),
            max_parallel_downloads: limit_var(
                MAX_PARALLEL_DOWNLOADS_ENV,
                DEFAULT_PARALLEL_DOWNLOADS,
            ),
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudmirror")
        .join("sync.db")
}

pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudmirror")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(lookup(&[]));
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.max_parallel_uploads, 1);
        assert_eq!(config.max_parallel_downloads, 2);
        assert!(config.db_path.ends_with("cloudmirror/sync.db"));
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            (DB_PATH_ENV, "/tmp/mirror.db"),
            (CACHE_DIR_ENV, "/tmp/mirror-cache"),
            (MAX_PARALLEL_UPLOADS_ENV, "3"),
            (MAX_PARALLEL_DOWNLOADS_ENV, " 8 "),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/tmp/mirror.db"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/mirror-cache"));
        assert_eq!(config.max_parallel_uploads, 3);
        assert_eq!(config.max_parallel_downloads, 8);
    }

    #[test]
    fn invalid_limits_fall_back_to_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            (MAX_PARALLEL_UPLOADS_ENV, "0"),
            (MAX_PARALLEL_DOWNLOADS_ENV, "many"),
            (DB_PATH_ENV, "  "),
        ]));
        assert_eq!(config.max_parallel_uploads, 1);
        assert_eq!(config.max_parallel_downloads, 2);
        assert_eq!(config.db_path, default_db_path());
    }
}
