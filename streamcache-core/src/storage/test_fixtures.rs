//! Test fixtures for piece cache testing.
//!
//! Provides a recording transfer engine and helpers for laying out piece
//! files the way a previous run would have left them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::torrent::{InfoHash, PieceIndex, PiecePriority, TorrentFile, TransferHandle};

pub const MIB: u64 = 1024 * 1024;

/// Info hash filled with `seed`.
pub fn info_hash(seed: u8) -> InfoHash {
    InfoHash::new([seed; 20])
}

/// Timestamp `seconds` after the Unix epoch.
pub fn at_seconds(seconds: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
}

/// Transfer engine stand-in that records priority changes.
#[derive(Debug, Default)]
pub struct MockTransfer {
    files: Vec<TorrentFile>,
    priorities: Mutex<HashMap<PieceIndex, PiecePriority>>,
    changes: Mutex<Vec<(PieceIndex, PiecePriority)>>,
}

impl MockTransfer {
    pub fn new(files: Vec<TorrentFile>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }

    /// Sets priorities without recording them as changes.
    pub fn preset(&self, indices: impl IntoIterator<Item = u32>, priority: PiecePriority) {
        let mut priorities = self.priorities.lock();
        for index in indices {
            priorities.insert(PieceIndex::new(index), priority);
        }
    }

    pub fn priority(&self, index: u32) -> PiecePriority {
        self.piece_priority(PieceIndex::new(index))
    }

    /// Sorted indices currently at normal priority.
    pub fn normal_pieces(&self) -> Vec<u32> {
        let mut pieces: Vec<u32> = self
            .priorities
            .lock()
            .iter()
            .filter(|(_, priority)| **priority == PiecePriority::Normal)
            .map(|(index, _)| index.as_u32())
            .collect();
        pieces.sort_unstable();
        pieces
    }

    /// Every priority change requested so far, in order.
    pub fn changes(&self) -> Vec<(PieceIndex, PiecePriority)> {
        self.changes.lock().clone()
    }
}

impl TransferHandle for MockTransfer {
    fn piece_priority(&self, index: PieceIndex) -> PiecePriority {
        self.priorities
            .lock()
            .get(&index)
            .copied()
            .unwrap_or_default()
    }

    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority) {
        self.priorities.lock().insert(index, priority);
        self.changes.lock().push((index, priority));
    }

    fn files(&self) -> Vec<TorrentFile> {
        self.files.clone()
    }
}

/// Writes a piece file of `size` bytes with the given modification time.
///
/// # Panics
///
/// Panics if the file cannot be written. This is acceptable in test fixtures
/// where failures indicate environment issues.
pub fn write_piece_file(dir: &Path, index: u32, size: usize, modified: SystemTime) {
    let path = dir.join(index.to_string());
    fs::write(&path, vec![0xAB; size]).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

/// Creates a temporary save path for disk-mode caches.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
pub fn create_temp_save_path() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}
