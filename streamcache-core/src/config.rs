//! Centralized configuration for streamcache.
//!
//! All tunable parameters of the piece cache are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;

use crate::StreamCacheError;
use crate::storage::FILE_RANGE_NOT_DELETE;

/// Central configuration for all streamcache components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct StreamCacheConfig {
    pub cache: CacheConfig,
}

/// Piece cache configuration.
///
/// Controls the working-set budget, disk backing, and reader window shape.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache capacity in bytes (0 derives it from piece length or read-ahead)
    pub capacity: u64,
    /// Whether pieces are backed by files instead of memory
    pub use_disk: bool,
    /// Root directory holding one subdirectory per torrent in disk mode
    pub save_path: PathBuf,
    /// Share of a reader's read-ahead placed in front of its cursor, in percent
    pub reader_read_ahead: u8,
    /// Bytes at the start and end of a streamed file that are never evicted
    pub protected_zone: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 0, // Derived per torrent
            use_disk: false,
            save_path: PathBuf::from("cache"),
            reader_read_ahead: 95,
            protected_zone: FILE_RANGE_NOT_DELETE,
        }
    }
}

impl CacheConfig {
    /// Creates a disk-backed configuration rooted at `save_path`.
    pub fn disk(save_path: impl Into<PathBuf>) -> Self {
        Self {
            use_disk: true,
            save_path: save_path.into(),
            ..Self::default()
        }
    }

    /// Sets a fixed capacity in bytes.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks value ranges that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// - `StreamCacheError::Configuration` - If the read-ahead share is outside 5..=100
    pub fn validate(&self) -> Result<(), StreamCacheError> {
        if !(5..=100).contains(&self.reader_read_ahead) {
            return Err(StreamCacheError::Configuration {
                reason: format!(
                    "reader read-ahead must be between 5 and 100 percent, got {}",
                    self.reader_read_ahead
                ),
            });
        }
        Ok(())
    }
}

impl StreamCacheConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Values that fail to parse keep their defaults; the merged result is
    /// validated before it is returned.
    ///
    /// # Errors
    ///
    /// - `StreamCacheError::Configuration` - If an override leaves the cache config out of range
    pub fn from_env() -> Result<Self, StreamCacheError> {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("STREAMCACHE_CACHE_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                config.cache.capacity = bytes;
            }
        }

        if let Ok(use_disk) = std::env::var("STREAMCACHE_USE_DISK") {
            config.cache.use_disk = use_disk.parse().unwrap_or(false);
        }

        if let Ok(path) = std::env::var("STREAMCACHE_SAVE_PATH") {
            config.cache.save_path = PathBuf::from(path);
        }

        if let Ok(read_ahead) = std::env::var("STREAMCACHE_READ_AHEAD") {
            if let Ok(percent) = read_ahead.parse::<u8>() {
                config.cache.reader_read_ahead = percent;
            }
        }

        config.cache.validate()?;
        Ok(config)
    }
}
