//! Read-only snapshots of cache state for the web layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Point-in-time view of one torrent's cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    /// Hex info hash of the torrent
    pub hash: String,
    pub capacity: u64,
    pub filled: u64,
    pub pieces_length: u64,
    pub pieces_count: u32,
    /// Pieces holding data, keyed by index
    pub pieces: BTreeMap<u32, ItemState>,
    pub readers: Vec<ReaderState>,
}

impl CacheState {
    /// Number of pieces the engine has verified.
    pub fn completed_pieces(&self) -> usize {
        self.pieces.values().filter(|item| item.completed).count()
    }
}

/// State of one materialized piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub id: u32,
    pub size: u64,
    pub length: u64,
    pub completed: bool,
}

/// Window and position of one active reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderState {
    pub start: u32,
    pub end: u32,
    /// Piece holding the reader's cursor
    pub reader: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_pieces() {
        let mut state = CacheState::default();
        for (id, completed) in [(0, true), (1, false), (4, true)] {
            state.pieces.insert(
                id,
                ItemState {
                    id,
                    size: 16,
                    length: 16,
                    completed,
                },
            );
        }

        assert_eq!(state.completed_pieces(), 2);
    }
}
