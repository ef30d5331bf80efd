//! Cache configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest max size we will derive from free disk space
const MIN_DEFAULT_MAX_SIZE: u64 = 20 * 1024 * 1024;
/// Largest max size we will derive from free disk space
const MAX_DEFAULT_MAX_SIZE: u64 = 4 * 1024 * 1024 * 1024;
/// Fallback when the free-space query itself fails
const FALLBACK_MAX_SIZE: u64 = 80 * 1024 * 1024;

/// Configuration for a cache backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the entry files and the index subdirectory
    pub path: PathBuf,
    /// Maximum total cache size in bytes; derived from free disk space when
    /// not set
    pub max_size: Option<u64>,
    /// How often the in-memory index is written back to disk. Zero disables
    /// the periodic flush (useful for tests).
    pub flush_interval: Duration,
    /// Skip materializing the stream-2 file while stream 2 is empty. A
    /// missing stream-2 file always reads as an empty stream regardless of
    /// this setting.
    pub omit_empty_stream2: bool,
    /// Upper bound on one entry's sparse payload bytes; exceeding it before
    /// an append drops all sparse ranges. Defaults to `max_size / 8`.
    pub sparse_budget: Option<u64>,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: None,
            flush_interval: Duration::from_secs(10),
            omit_empty_stream2: true,
            sparse_budget: None,
        }
    }

    /// The effective maximum cache size: the configured value, or a tenth of
    /// the available space on the cache directory's disk, clamped to a sane
    /// range.
    pub fn resolved_max_size(&self) -> u64 {
        if let Some(size) = self.max_size {
            return size;
        }
        match available_disk_space(&self.path) {
            Some(avail) => (avail / 10).clamp(MIN_DEFAULT_MAX_SIZE, MAX_DEFAULT_MAX_SIZE),
            None => FALLBACK_MAX_SIZE,
        }
    }

    /// The effective sparse-data budget for one entry
    pub fn resolved_sparse_budget(&self) -> u64 {
        self.sparse_budget
            .unwrap_or_else(|| self.resolved_max_size() / 8)
    }
}

/// Available bytes on the disk holding `path`, by longest mount-point match
fn available_disk_space(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(sysinfo::Disk::available_space)
}
