//! Streamcache Core - piece cache for BitTorrent media streaming
//!
//! This crate keeps downloaded torrent pieces in a bounded memory or disk
//! cache, evicts pieces no active viewer needs, and steers the transfer
//! engine's piece priorities toward the byte ranges being streamed.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{CacheConfig, StreamCacheConfig};
pub use storage::{
    Cache, CacheError, CacheRegistry, CacheState, ItemState, Piece, PieceIo, PieceWindow, Reader,
    ReaderState,
};
pub use torrent::{InfoHash, PieceIndex, PiecePriority, TorrentFile, TorrentLayout, TransferHandle};

/// Errors that can bubble up from any streamcache subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StreamCacheError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamCacheError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            StreamCacheError::Cache(e) => match e {
                CacheError::FileIndexOutOfRange { index, count } => {
                    format!("File {index} does not exist, torrent has {count} files")
                }
                CacheError::InvalidInfoHash { value } => format!("Invalid info hash: {value}"),
                CacheError::Closed { info_hash } => format!("Torrent {info_hash} is closed"),
                _ => "Cache error occurred".to_string(),
            },
            StreamCacheError::Configuration { reason } => format!("Configuration error: {reason}"),
            StreamCacheError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StreamCacheError::Configuration { .. }
                | StreamCacheError::Cache(CacheError::FileIndexOutOfRange { .. })
                | StreamCacheError::Cache(CacheError::InvalidInfoHash { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, StreamCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_file_is_user_error() {
        let error = StreamCacheError::from(CacheError::FileIndexOutOfRange { index: 4, count: 2 });

        assert!(error.is_user_error());
        assert_eq!(
            error.user_message(),
            "File 4 does not exist, torrent has 2 files"
        );
    }

    #[test]
    fn test_io_error_is_not_user_error() {
        let error = StreamCacheError::from(std::io::Error::other("disk gone"));

        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "File system error occurred");
    }
}
