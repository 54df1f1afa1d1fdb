//! Index configuration.

use crate::error::{KestrelError, Result};
use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of zones an index may be configured with.
pub const MAX_ZONES: u32 = 16;

/// Default mean delta between consecutive volume index keys.
pub const DEFAULT_VOLUME_INDEX_MEAN_DELTA: u32 = 4096;

/// Configuration for a KestrelDB index instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// The volume geometry.
    pub geometry: Geometry,
    /// Number of parallel zones (one request thread each).
    pub zone_count: u32,
    /// Mean delta between consecutive keys in a volume index delta list.
    pub volume_index_mean_delta: u32,
    /// Number of chapters the sparse chapter index cache can hold.
    pub cache_chapters: u32,
    /// One in this many names is a sample (hook) in a sparse index.
    pub sparse_sample_rate: u32,
    /// Number of page cache reader threads.
    pub read_threads: u32,
    /// Number of chapters' worth of pages held by the page cache.
    pub cache_chapters_of_pages: u32,
    /// Directory for the volume file and index saves.
    pub data_dir: PathBuf,
    /// Nonce stamped on every chapter index page of this volume.
    pub nonce: u64,
    /// Enable fsync after volume writes.
    pub fsync_enabled: bool,
}

impl IndexConfig {
    /// Creates a configuration with default tuning for the given geometry.
    pub fn new(geometry: Geometry, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            geometry,
            zone_count: 1,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            cache_chapters: 3,
            sparse_sample_rate: 32,
            read_threads: 2,
            cache_chapters_of_pages: 5,
            data_dir: data_dir.into(),
            nonce: 0x6b65_7374_7265_6c00,
            fsync_enabled: false,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.zone_count == 0 || self.zone_count > MAX_ZONES {
            return Err(KestrelError::ConfigError(format!(
                "zone count {} not in 1..={}",
                self.zone_count, MAX_ZONES
            )));
        }
        if self.geometry.records_per_chapter < self.zone_count {
            return Err(KestrelError::ConfigError(format!(
                "{} records per chapter cannot be split across {} zones",
                self.geometry.records_per_chapter, self.zone_count
            )));
        }
        if self.read_threads == 0 {
            return Err(KestrelError::ConfigError(
                "at least one reader thread is required".to_string(),
            ));
        }
        if self.volume_index_mean_delta < 2 {
            return Err(KestrelError::ConfigError(format!(
                "mean delta {} too small",
                self.volume_index_mean_delta
            )));
        }
        if self.geometry.is_sparse() && self.cache_chapters == 0 {
            return Err(KestrelError::ConfigError(
                "a sparse index requires a sparse cache".to_string(),
            ));
        }
        if self.geometry.is_sparse() && self.sparse_sample_rate < 2 {
            return Err(KestrelError::ConfigError(format!(
                "sample rate {} too small for a sparse index",
                self.sparse_sample_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = IndexConfig::new(Geometry::small_test(), "./data");
        assert_eq!(config.zone_count, 1);
        assert_eq!(config.volume_index_mean_delta, DEFAULT_VOLUME_INDEX_MEAN_DELTA);
        assert!(config.read_threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_zone_count_bounds() {
        let mut config = IndexConfig::new(Geometry::small_test(), "./data");
        config.zone_count = 0;
        assert!(config.validate().is_err());
        config.zone_count = MAX_ZONES + 1;
        assert!(config.validate().is_err());
        config.zone_count = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_reader_threads_required() {
        let mut config = IndexConfig::new(Geometry::small_test(), "./data");
        config.read_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sparse_requires_cache() {
        let geometry = Geometry::new(3072, 2, 10, 8).unwrap();
        let mut config = IndexConfig::new(geometry, "./data");
        config.cache_chapters = 0;
        assert!(config.validate().is_err());
        config.cache_chapters = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let original = IndexConfig::new(Geometry::small_test(), "./data");
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: IndexConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.zone_count, deserialized.zone_count);
        assert_eq!(original.geometry, deserialized.geometry);
        assert_eq!(original.data_dir, deserialized.data_dir);
    }
}
