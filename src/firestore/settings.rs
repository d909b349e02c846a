use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::model::DatabaseId;

pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 40 * 1024 * 1024;
pub const DEFAULT_GC_PERCENTILE: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_INDEX_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST: f64 = 8.0;

/// Where the local cache lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceMode {
    Memory,
    /// Durable JSON image at the given path; falls back to memory if unusable.
    File(PathBuf),
}

/// Stream timing knobs.
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    pub initial_backoff_delay: Duration,
    pub backoff_factor: f64,
    pub max_backoff_delay: Duration,
    pub offline_retry_delay: Duration,
    pub idle_timeout: Duration,
    pub online_state_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            initial_backoff_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_backoff_delay: Duration::from_secs(60),
            offline_retry_delay: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceMode,
    /// `None` disables LRU collection.
    pub cache_size_bytes: Option<u64>,
    pub gc_percentile: u32,
    pub max_sequence_numbers_to_collect: usize,
    pub gc_initial_delay: Duration,
    pub gc_interval: Duration,
    pub max_concurrent_limbo_resolutions: usize,
    pub auto_index_creation: bool,
    pub index_min_collection_size: usize,
    pub relative_index_read_cost: f64,
    pub remote: RemoteSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default_for("offline-sync"),
            persistence: PersistenceMode::Memory,
            cache_size_bytes: Some(DEFAULT_CACHE_SIZE_BYTES),
            gc_percentile: DEFAULT_GC_PERCENTILE,
            max_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
            gc_initial_delay: Duration::from_secs(60),
            gc_interval: Duration::from_secs(5 * 60),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            auto_index_creation: true,
            index_min_collection_size: DEFAULT_INDEX_MIN_COLLECTION_SIZE,
            relative_index_read_cost: DEFAULT_RELATIVE_INDEX_READ_COST,
            remote: RemoteSettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            ..Self::default()
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_cache_size_bytes(mut self, bytes: Option<u64>) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    pub fn with_gc_percentile(mut self, percentile: u32) -> Self {
        self.gc_percentile = percentile.min(100);
        self
    }

    pub fn with_max_sequence_numbers_to_collect(mut self, max: usize) -> Self {
        self.max_sequence_numbers_to_collect = max;
        self
    }

    pub fn with_gc_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.gc_initial_delay = initial_delay;
        self.gc_interval = interval;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_auto_index_creation(mut self, enabled: bool) -> Self {
        self.auto_index_creation = enabled;
        self
    }

    pub fn with_index_thresholds(mut self, min_collection_size: usize, relative_read_cost: f64) -> Self {
        self.index_min_collection_size = min_collection_size;
        self.relative_index_read_cost = relative_read_cost;
        self
    }

    pub fn with_remote(mut self, remote: RemoteSettings) -> Self {
        self.remote = remote;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.cache_size_bytes, Some(40 * 1024 * 1024));
        assert_eq!(settings.gc_percentile, 10);
        assert_eq!(settings.max_sequence_numbers_to_collect, 1000);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.remote.max_backoff_delay, Duration::from_secs(60));
        assert_eq!(settings.persistence, PersistenceMode::Memory);
    }

    #[test]
    fn builders_clamp_inputs() {
        let settings = FirestoreSettings::default()
            .with_gc_percentile(250)
            .with_max_concurrent_limbo_resolutions(0)
            .with_cache_size_bytes(None);
        assert_eq!(settings.gc_percentile, 100);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 1);
        assert!(settings.cache_size_bytes.is_none());
    }
}
