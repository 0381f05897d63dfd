//! Storage layer for streamed torrent data.
//!
//! Holds the per-torrent piece caches that sit between the transfer engine and
//! the streaming front end, plus the errors they report.

pub mod piece_cache;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::time::Duration;

pub use piece_cache::{
    Cache, CacheRegistry, CacheState, ItemState, Piece, PieceIo, PieceWindow, Reader, ReaderId,
    ReaderState, in_windows, merge_windows,
};

use crate::torrent::InfoHash;

/// Bytes at each end of a streamed file that eviction never touches.
///
/// Players probe container headers and indexes at both ends of a file no
/// matter where playback is.
pub const FILE_RANGE_NOT_DELETE: u64 = 5 * 1024 * 1024;

/// Incomplete pieces boosted ahead of a reader per maintenance pass.
pub const PREFETCH_LIMIT: usize = 5;

/// Delay between a reader closing and priorities being relaxed.
pub const PRIORITY_RELAX_DELAY: Duration = Duration::from_secs(1);

/// Errors that occur during piece cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Streaming layer asked for a file the torrent does not have
    #[error("File index {index} out of range (torrent has {count} files)")]
    FileIndexOutOfRange {
        /// Requested one-based file index
        index: usize,
        /// Number of files in the torrent
        count: usize,
    },

    /// Piece index outside the torrent's piece table
    #[error("Piece {index} out of range (torrent has {count} pieces)")]
    PieceOutOfRange { index: u32, count: u32 },

    /// Write would extend a piece past its length
    #[error("Write to piece {index} ends at {end}, past piece length {length}")]
    PieceOverflow { index: u32, end: u64, length: u64 },

    /// Seek target before the start of the file
    #[error("Invalid seek to offset {offset}")]
    InvalidSeek { offset: i64 },

    /// No transfer engine handle has been attached to the cache
    #[error("Cache has no transfer handle attached")]
    TransferDetached,

    /// Cache was closed and its state released
    #[error("Cache for torrent {info_hash} is closed")]
    Closed { info_hash: InfoHash },

    /// Info hash text could not be decoded
    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
