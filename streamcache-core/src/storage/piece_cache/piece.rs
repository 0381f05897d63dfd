//! Cached torrent pieces.
//!
//! A piece is backed either by an in-memory buffer or by a file named after
//! its index inside the torrent's cache directory. The transfer engine writes
//! into pieces as data arrives and the streaming layer reads them back through
//! [`PieceIo`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Weak;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::cache::Cache;
use crate::storage::CacheError;

/// Storage capability the transfer engine needs from a piece.
pub trait PieceIo: Send + Sync {
    /// Reads materialized bytes starting at `offset` into `buf`.
    ///
    /// Returns 0 when nothing has been written at `offset` yet.
    ///
    /// # Errors
    ///
    /// - `CacheError::Io` - If the backing file cannot be read
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError>;

    /// Writes `data` at `offset` within the piece.
    ///
    /// # Errors
    ///
    /// - `CacheError::PieceOverflow` - If the write ends past the piece length
    /// - `CacheError::Io` - If the backing file cannot be written
    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, CacheError>;

    /// Bytes currently materialized.
    fn size(&self) -> u64;

    /// Whether the engine has verified the piece.
    fn is_complete(&self) -> bool;

    fn mark_complete(&self);

    fn mark_not_complete(&self);
}

#[derive(Debug)]
enum Backing {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

#[derive(Debug)]
struct PieceState {
    /// Byte ranges written so far, sorted, disjoint and non-adjacent
    written: Vec<Range<u64>>,
    complete: bool,
    accessed: SystemTime,
    backing: Backing,
}

impl PieceState {
    fn size(&self) -> u64 {
        self.written.iter().map(|range| range.end - range.start).sum()
    }

    /// Length of the written run starting at byte 0.
    fn written_prefix(&self) -> u64 {
        match self.written.first() {
            Some(range) if range.start == 0 => range.end,
            _ => 0,
        }
    }

    fn record_write(&mut self, range: Range<u64>) {
        let mut merged = range;
        self.written.retain(|existing| {
            let touches = existing.start <= merged.end && merged.start <= existing.end;
            if touches {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
            }
            !touches
        });
        let at = self
            .written
            .partition_point(|existing| existing.start < merged.start);
        self.written.insert(at, merged);
    }
}

/// One fixed-size chunk of torrent data held by a [`Cache`].
#[derive(Debug)]
pub struct Piece {
    id: u32,
    length: u64,
    state: Mutex<PieceState>,
    cache: Weak<Cache>,
}

impl Piece {
    pub(crate) fn in_memory(id: u32, length: u64, cache: Weak<Cache>) -> Self {
        Self::with_backing(id, length, Backing::Memory(Vec::new()), cache)
    }

    pub(crate) fn on_disk(id: u32, length: u64, path: PathBuf, cache: Weak<Cache>) -> Self {
        Self::with_backing(id, length, Backing::Disk(path), cache)
    }

    fn with_backing(id: u32, length: u64, backing: Backing, cache: Weak<Cache>) -> Self {
        Self {
            id,
            length,
            state: Mutex::new(PieceState {
                written: Vec::new(),
                complete: false,
                accessed: SystemTime::UNIX_EPOCH,
                backing,
            }),
            cache,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Full target length of the piece.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Last time the piece was read or written.
    pub fn accessed(&self) -> SystemTime {
        self.state.lock().accessed
    }

    /// Overrides the last-access time, e.g. with a file modification time.
    pub fn set_accessed(&self, accessed: SystemTime) {
        self.state.lock().accessed = accessed;
    }

    /// Whether the piece keeps its bytes in a file.
    pub fn is_disk_backed(&self) -> bool {
        matches!(self.state.lock().backing, Backing::Disk(_))
    }

    /// Reinstates state found on disk at startup.
    pub(crate) fn restore(&self, size: u64, accessed: SystemTime) {
        let mut state = self.state.lock();
        state.written = if size > 0 { vec![0..size] } else { Vec::new() };
        state.complete = size == self.length;
        state.accessed = accessed;
    }

    /// Cuts an incomplete piece file back to the bytes written from its start,
    /// so a restore never sees a file with holes.
    pub(crate) fn trim_to_written(&self) {
        let state = self.state.lock();
        let Backing::Disk(path) = &state.backing else {
            return;
        };
        if state.complete || state.written.is_empty() {
            return;
        }

        let prefix = state.written_prefix();
        let result = if prefix == 0 {
            fs::remove_file(path)
        } else {
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(prefix))
        };
        match result {
            Ok(()) => trace!("Trimmed piece {} to {} bytes", self.id, prefix),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to trim piece file {}: {}", path.display(), e),
        }
    }

    /// Drops the piece's bytes and returns how many were held.
    pub(crate) fn release(&self) -> u64 {
        let mut state = self.state.lock();
        let freed = state.size();
        match &mut state.backing {
            Backing::Memory(buffer) => *buffer = Vec::new(),
            Backing::Disk(path) => {
                if let Err(e) = fs::remove_file(&*path) {
                    if e.kind() != ErrorKind::NotFound {
                        warn!("Failed to remove piece file {}: {}", path.display(), e);
                    }
                }
            }
        }
        state.written.clear();
        state.complete = false;
        trace!("Released piece {} ({} bytes)", self.id, freed);
        freed
    }
}

impl PieceIo for Piece {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let mut state = self.state.lock();
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(run_end) = state
            .written
            .iter()
            .find(|range| range.contains(&offset))
            .map(|range| range.end)
        else {
            return Ok(0);
        };
        let available = usize::try_from(run_end - offset).unwrap_or(usize::MAX);
        let count = buf.len().min(available);

        match &state.backing {
            Backing::Memory(buffer) => {
                let start = offset as usize;
                buf[..count].copy_from_slice(&buffer[start..start + count]);
            }
            Backing::Disk(path) => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf[..count])?;
            }
        }
        state.accessed = SystemTime::now();
        Ok(count)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, CacheError> {
        let end = offset.saturating_add(data.len() as u64);
        if end > self.length {
            return Err(CacheError::PieceOverflow {
                index: self.id,
                end,
                length: self.length,
            });
        }

        if data.is_empty() {
            return Ok(0);
        }

        let materialized = {
            let mut state = self.state.lock();
            let materialized = state.written.is_empty();
            match &mut state.backing {
                Backing::Memory(buffer) => {
                    let end = end as usize;
                    if buffer.len() < end {
                        buffer.reserve_exact(self.length as usize - buffer.len());
                        buffer.resize(end, 0);
                    }
                    buffer[offset as usize..end].copy_from_slice(data);
                }
                Backing::Disk(path) => {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .truncate(false)
                        .write(true)
                        .open(&*path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(data)?;
                }
            }
            state.record_write(offset..end);
            state.accessed = SystemTime::now();
            materialized
        };

        // Maintenance runs when a piece first holds data, not on every block
        if materialized {
            if let Some(cache) = self.cache.upgrade() {
                cache.piece_written();
            }
        }
        Ok(data.len())
    }

    fn size(&self) -> u64 {
        self.state.lock().size()
    }

    fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    fn mark_complete(&self) {
        self.state.lock().complete = true;
    }

    fn mark_not_complete(&self) {
        self.state.lock().complete = false;
    }
}
