//! Stream readers and their piece windows.
//!
//! A reader only reports where its consumer is. The owning cache turns the
//! reported windows into eviction and priority decisions.

use std::io::SeekFrom;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::cache::Cache;
use super::range::PieceWindow;
use crate::storage::CacheError;
use crate::torrent::TorrentFile;

/// Opaque identifier of a reader within its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(pub(crate) u64);

impl std::fmt::Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

#[derive(Debug)]
struct Cursor {
    /// Absolute byte offset within the torrent
    offset: u64,
    readahead: u64,
}

/// One open stream of one file of a torrent.
#[derive(Debug)]
pub struct Reader {
    id: ReaderId,
    file: TorrentFile,
    piece_length: u64,
    read_ahead_percent: u64,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
    cache: Weak<Cache>,
}

impl Reader {
    pub(crate) fn new(
        id: ReaderId,
        file: TorrentFile,
        piece_length: u64,
        readahead: u64,
        read_ahead_percent: u8,
        cache: Weak<Cache>,
    ) -> Self {
        let offset = file.offset;
        Self {
            id,
            file,
            piece_length: piece_length.max(1),
            read_ahead_percent: u64::from(read_ahead_percent.min(100)),
            cursor: Mutex::new(Cursor { offset, readahead }),
            closed: AtomicBool::new(false),
            cache,
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// File this reader streams.
    pub fn file(&self) -> &TorrentFile {
        &self.file
    }

    pub fn readahead(&self) -> u64 {
        self.cursor.lock().readahead
    }

    /// Changes the byte span the window covers around the cursor.
    pub fn set_readahead(&self, readahead: u64) {
        self.cursor.lock().readahead = readahead;
    }

    /// Cursor position relative to the start of the file.
    pub fn position(&self) -> u64 {
        self.cursor.lock().offset - self.file.offset
    }

    /// Moves the cursor, clamping it to the file.
    ///
    /// Returns the new position relative to the start of the file.
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidSeek` - If the target lies before the start of the file
    pub fn seek(&self, target: SeekFrom) -> Result<u64, CacheError> {
        let mut cursor = self.cursor.lock();
        let current = (cursor.offset - self.file.offset) as i64;
        let length = self.file.length as i64;

        let position = match target {
            SeekFrom::Start(position) => i64::try_from(position).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => current.saturating_add(delta),
            SeekFrom::End(delta) => length.saturating_add(delta),
        };
        if position < 0 {
            return Err(CacheError::InvalidSeek { offset: position });
        }

        let position = (position as u64).min(self.file.length);
        cursor.offset = self.file.offset + position;
        Ok(position)
    }

    /// Advances the cursor after the consumer read `bytes`.
    pub fn advance(&self, bytes: u64) {
        let mut cursor = self.cursor.lock();
        cursor.offset = cursor.offset.saturating_add(bytes).min(self.file.end());
    }

    /// Piece window derived from the cursor and read-ahead.
    ///
    /// `read_ahead_percent` of the read-ahead lies in front of the cursor and
    /// the remainder trails it; the byte span is clamped to the file.
    pub fn pieces_range(&self) -> PieceWindow {
        let cursor = self.cursor.lock();
        let ahead = cursor.readahead / 100 * self.read_ahead_percent
            + cursor.readahead % 100 * self.read_ahead_percent / 100;
        let behind = cursor.readahead - ahead;

        let begin = cursor.offset.saturating_sub(behind).max(self.file.offset);
        let end = cursor.offset.saturating_add(ahead).min(self.file.end());

        let start_piece = self.piece_of(begin);
        let end_piece = self.piece_of(end.saturating_sub(1).max(begin));
        PieceWindow::new(start_piece, end_piece, self.file.clone())
    }

    /// Piece holding the cursor.
    pub fn reader_piece(&self) -> u32 {
        let offset = self.cursor.lock().offset;
        let last_byte = self.file.end().saturating_sub(1).max(self.file.offset);
        self.piece_of(offset.min(last_byte))
    }

    /// Deregisters the reader from its cache.
    ///
    /// Closing an already closed reader does nothing.
    pub fn close(&self) {
        match self.cache.upgrade() {
            Some(cache) => cache.close_reader(self),
            None => {
                self.mark_closed();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true for the call that actually closed the reader.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn piece_of(&self, offset: u64) -> u32 {
        u32::try_from(offset / self.piece_length).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn reader(file: TorrentFile, readahead: u64, percent: u8) -> Reader {
        Reader::new(ReaderId(1), file, MIB, readahead, percent, Weak::new())
    }

    #[test]
    fn test_window_starts_at_file_offset() {
        let reader = reader(TorrentFile::new("b.mkv", 4 * MIB, 3 * MIB), 3 * MIB, 100);

        assert_eq!(reader.position(), 0);
        assert_eq!(reader.reader_piece(), 4);

        let window = reader.pieces_range();
        assert_eq!((window.start, window.end), (4, 6));
        assert_eq!(window.file.path, "b.mkv");
    }

    #[test]
    fn test_window_splits_readahead_around_cursor() {
        let reader = reader(TorrentFile::new("a.mkv", 0, 100 * MIB), 10 * MIB, 80);
        reader.seek(SeekFrom::Start(50 * MIB)).unwrap();

        // 8 MiB ahead, 2 MiB behind
        let window = reader.pieces_range();
        assert_eq!((window.start, window.end), (48, 57));
        assert_eq!(reader.reader_piece(), 50);
    }

    #[test]
    fn test_window_clamped_to_file_end() {
        let reader = reader(TorrentFile::new("a.mkv", 0, 10 * MIB), 4 * MIB, 100);
        reader.seek(SeekFrom::End(-(MIB as i64))).unwrap();

        let window = reader.pieces_range();
        assert_eq!((window.start, window.end), (9, 9));
    }

    #[test]
    fn test_readahead_change_moves_window() {
        let reader = reader(TorrentFile::new("a.mkv", 0, 100 * MIB), 2 * MIB, 100);
        assert_eq!(reader.pieces_range().end, 1);

        reader.set_readahead(6 * MIB);
        assert_eq!(reader.readahead(), 6 * MIB);
        assert_eq!(reader.pieces_range().end, 5);
    }

    #[test]
    fn test_seek_variants() {
        let reader = reader(TorrentFile::new("a.mkv", 10, 100), 0, 95);

        assert_eq!(reader.seek(SeekFrom::Start(40)).unwrap(), 40);
        assert_eq!(reader.seek(SeekFrom::Current(-15)).unwrap(), 25);
        assert_eq!(reader.seek(SeekFrom::End(-10)).unwrap(), 90);
        assert_eq!(reader.seek(SeekFrom::Start(500)).unwrap(), 100);
        assert!(matches!(
            reader.seek(SeekFrom::Current(-101)),
            Err(CacheError::InvalidSeek { offset: -1 })
        ));
        assert_eq!(reader.position(), 100);
    }

    #[test]
    fn test_advance_stops_at_file_end() {
        let reader = reader(TorrentFile::new("a.mkv", 0, 3 * MIB), MIB, 100);

        reader.advance(MIB + 1);
        assert_eq!(reader.reader_piece(), 1);

        reader.advance(10 * MIB);
        assert_eq!(reader.position(), 3 * MIB);
        assert_eq!(reader.reader_piece(), 2);
    }

    #[test]
    fn test_empty_file_window() {
        let reader = reader(TorrentFile::new("empty", 2 * MIB, 0), MIB, 95);

        let window = reader.pieces_range();
        assert_eq!((window.start, window.end), (2, 2));
        assert_eq!(reader.reader_piece(), 2);
    }

    #[test]
    fn test_close_without_cache() {
        let reader = reader(TorrentFile::new("a.mkv", 0, MIB), MIB, 95);

        reader.close();
        assert!(reader.is_closed());
        assert!(!reader.mark_closed());
    }
}
