use std::path::Path;

use crate::*;

/// Sizes and threading for a [LoadEngine] and its [DiskLruStore].  Build with [CacheConfigBuilder].
#[derive(Debug, Clone, derive_builder::Builder)]
pub struct CacheConfig {
    /// Byte budget of the disk store.
    pub max_disk_size: u64,
    /// Byte budget of the memory cache, before [CacheConfig::memory_size_multiplier] is applied.
    pub max_memory_size: u64,
    #[builder(default = "1.0")]
    pub memory_size_multiplier: f32,
    /// Values stored per disk entry.  The engine only uses the first.
    #[builder(default = "1")]
    pub values_per_entry: usize,
    /// Bumping this invalidates every disk store written with an older version.
    #[builder(default = "1")]
    pub app_version: u32,
    /// Threads running pipeline stages.
    #[builder(default = "4")]
    pub worker_threads: usize,
}

impl CacheConfig {
    pub fn open_disk_store(&self, directory: impl AsRef<Path>) -> Result<DiskLruStore, StoreError> {
        DiskLruStore::open(
            directory,
            self.app_version,
            self.values_per_entry,
            self.max_disk_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfigBuilder::default()
            .max_disk_size(1000)
            .max_memory_size(100)
            .build()
            .unwrap();
        assert_eq!(config.memory_size_multiplier, 1.0);
        assert_eq!(config.values_per_entry, 1);
        assert_eq!(config.app_version, 1);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn test_sizes_are_required() {
        assert!(CacheConfigBuilder::default()
            .max_memory_size(100)
            .build()
            .is_err());
    }

    #[test]
    fn test_open_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfigBuilder::default()
            .max_disk_size(1000)
            .max_memory_size(100)
            .values_per_entry(2)
            .build()
            .unwrap();
        let store = config.open_disk_store(dir.path()).unwrap();
        assert_eq!(store.value_count(), 2);
        assert_eq!(store.max_size(), 1000);
    }
}
