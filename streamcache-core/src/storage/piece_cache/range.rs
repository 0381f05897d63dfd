//! Piece-index windows and their merge.
//!
//! Every reader reports the closed interval of pieces it needs. The cache
//! merges those intervals once per pass and answers membership questions
//! against the merged set.

use crate::torrent::TorrentFile;

/// Closed interval of piece indices needed for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWindow {
    pub start: u32,
    pub end: u32,
    pub file: TorrentFile,
}

impl PieceWindow {
    pub fn new(start: u32, end: u32, file: TorrentFile) -> Self {
        Self { start, end, file }
    }

    /// Whether `index` lies inside the window.
    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.end
    }
}

/// Merges overlapping and adjacent windows into a sorted disjoint list.
///
/// A merged window keeps the file of the first window that opened it.
pub fn merge_windows(mut windows: Vec<PieceWindow>) -> Vec<PieceWindow> {
    if windows.len() <= 1 {
        return windows;
    }
    windows.sort_by_key(|window| window.start);

    let mut merged: Vec<PieceWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(last) if window.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(window.end);
            }
            _ => merged.push(window),
        }
    }
    merged
}

/// Whether `index` falls inside any of `windows`.
pub fn in_windows(windows: &[PieceWindow], index: u32) -> bool {
    windows.iter().any(|window| window.contains(index))
}
