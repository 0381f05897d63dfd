//! Torrent identities and the transfer-engine boundary.
//!
//! The cache never speaks the wire protocol itself. It reads the torrent's
//! file list and per-piece priorities through [`TransferHandle`] and asks the
//! engine to change them.

use std::fmt;

use crate::storage::CacheError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file. Its hex form
/// names the torrent's cache directory in disk mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidInfoHash` - If the input is not 20 hex-encoded bytes
    pub fn from_hex(value: &str) -> Result<Self, CacheError> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(value.trim(), &mut hash).map_err(|_| CacheError::InvalidInfoHash {
            value: value.to_string(),
        })?;
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex encoding of the hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download priority the transfer engine assigns to a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    /// Not requested from peers
    #[default]
    None,
    /// Requested in regular order
    Normal,
}

/// One file inside a torrent, addressed by its byte span in the torrent's
/// concatenated data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TorrentFile {
    /// Path of the file inside the torrent
    pub path: String,
    /// Byte offset of the first byte of the file
    pub offset: u64,
    /// File length in bytes
    pub length: u64,
}

impl TorrentFile {
    pub fn new(path: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    /// Byte offset one past the last byte of the file.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Piece geometry of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_length: u64,
    pub piece_count: u32,
    /// Total payload size; 0 when unknown, in which case every piece is full length
    pub total_length: u64,
}

impl TorrentLayout {
    pub fn new(piece_length: u64, piece_count: u32) -> Self {
        Self {
            piece_length,
            piece_count,
            total_length: 0,
        }
    }

    /// Records the payload size so the final piece gets its real length.
    pub fn with_total_length(mut self, total_length: u64) -> Self {
        self.total_length = total_length;
        self
    }

    /// Target length of a specific piece.
    pub fn piece_size(&self, index: u32) -> u64 {
        if index >= self.piece_count {
            return 0;
        }
        if self.total_length == 0 || index + 1 < self.piece_count {
            return self.piece_length;
        }
        let last_offset = u64::from(index) * self.piece_length;
        self.total_length
            .saturating_sub(last_offset)
            .min(self.piece_length)
    }

    /// Index of the piece holding `offset`.
    pub fn piece_of(&self, offset: u64) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        u32::try_from(offset / self.piece_length).unwrap_or(u32::MAX)
    }
}

/// Handle into the BitTorrent transfer engine driving one torrent.
///
/// Implementations must be cheap to call; the cache invokes these methods from
/// its maintenance passes without holding any of its own locks.
pub trait TransferHandle: Send + Sync {
    /// Current download priority of a piece.
    fn piece_priority(&self, index: PieceIndex) -> PiecePriority;

    /// Requests a new download priority for a piece.
    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority);

    /// Files of the torrent in the order the streaming layer addresses them.
    fn files(&self) -> Vec<TorrentFile>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let info_hash = InfoHash::from_hex(hex).unwrap();

        assert_eq!(info_hash.to_hex(), hex);
        assert_eq!(info_hash.to_string(), hex);
        assert_eq!(info_hash.as_bytes()[0], 0x01);
    }

    #[test]
    fn test_info_hash_rejects_short_input() {
        assert!(matches!(
            InfoHash::from_hex("abcd"),
            Err(CacheError::InvalidInfoHash { .. })
        ));
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_layout_last_piece_size() {
        let layout = TorrentLayout::new(1024, 10).with_total_length(9344);

        assert_eq!(layout.piece_size(0), 1024);
        assert_eq!(layout.piece_size(8), 1024);
        assert_eq!(layout.piece_size(9), 128);
        assert_eq!(layout.piece_size(10), 0);
    }

    #[test]
    fn test_layout_without_total_length() {
        let layout = TorrentLayout::new(1024, 4);

        assert_eq!(layout.piece_size(3), 1024);
        assert_eq!(layout.piece_of(0), 0);
        assert_eq!(layout.piece_of(1023), 0);
        assert_eq!(layout.piece_of(1024), 1);
    }

    #[test]
    fn test_file_end() {
        let file = TorrentFile::new("movie.mkv", 100, 50);
        assert_eq!(file.end(), 150);
    }
}
