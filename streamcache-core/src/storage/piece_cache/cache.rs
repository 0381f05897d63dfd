//! Per-torrent piece cache.
//!
//! The cache owns every piece of one torrent and the readers streaming from
//! it. Its maintenance passes merge the readers' windows, evict the oldest
//! pieces nobody needs once the cache is over capacity, and raise the transfer
//! priority of the pieces right in front of each reader.
//!
//! Reader windows are snapshotted under the readers lock; every call into the
//! transfer engine happens after that lock is released.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::piece::{Piece, PieceIo};
use super::range::{PieceWindow, in_windows, merge_windows};
use super::reader::{Reader, ReaderId};
use super::registry::CacheRegistry;
use super::state::{CacheState, ItemState, ReaderState};
use crate::config::CacheConfig;
use crate::storage::{CacheError, PREFETCH_LIMIT, PRIORITY_RELAX_DELAY};
use crate::torrent::{
    InfoHash, PieceIndex, PiecePriority, TorrentFile, TorrentLayout, TransferHandle,
};

/// Piece cache of one torrent.
pub struct Cache {
    info_hash: InfoHash,
    layout: TorrentLayout,
    /// Operator-configured capacity, 0 when derived
    configured_capacity: u64,
    read_ahead_percent: u8,
    protected_zone: u64,
    directory: Option<PathBuf>,
    capacity: AtomicU64,
    filled: AtomicU64,
    pieces: RwLock<Vec<Arc<Piece>>>,
    readers: Mutex<HashMap<ReaderId, Arc<Reader>>>,
    next_reader_id: AtomicU64,
    /// Held by at most one maintenance pass at a time
    maintenance: Mutex<()>,
    transfer: RwLock<Option<Arc<dyn TransferHandle>>>,
    registry: Weak<CacheRegistry>,
    closed: AtomicBool,
}

impl Cache {
    /// Creates the cache and its full piece table.
    ///
    /// In disk mode the torrent's directory is created and any piece files
    /// already in it are restored. A directory that cannot be created or read
    /// is logged and the cache starts empty.
    pub fn new(
        info_hash: InfoHash,
        layout: TorrentLayout,
        config: &CacheConfig,
        registry: Weak<CacheRegistry>,
    ) -> Arc<Self> {
        info!(
            "Create cache for {}: {} pieces of {} bytes",
            info_hash, layout.piece_count, layout.piece_length
        );

        let capacity = if config.capacity == 0 {
            layout.piece_length * 4
        } else {
            config.capacity
        };

        let directory = config
            .use_disk
            .then(|| config.save_path.join(info_hash.to_hex()));
        if let Some(dir) = &directory {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!("Failed to create cache directory {}: {}", dir.display(), e);
            }
        }

        let cache = Arc::new_cyclic(|this: &Weak<Cache>| {
            let pieces = (0..layout.piece_count)
                .map(|id| {
                    let length = layout.piece_size(id);
                    let piece = match &directory {
                        Some(dir) => {
                            Piece::on_disk(id, length, dir.join(id.to_string()), this.clone())
                        }
                        None => Piece::in_memory(id, length, this.clone()),
                    };
                    Arc::new(piece)
                })
                .collect();

            Self {
                info_hash,
                layout,
                configured_capacity: config.capacity,
                read_ahead_percent: config.reader_read_ahead,
                protected_zone: config.protected_zone,
                directory: directory.clone(),
                capacity: AtomicU64::new(capacity),
                filled: AtomicU64::new(0),
                pieces: RwLock::new(pieces),
                readers: Mutex::new(HashMap::new()),
                next_reader_id: AtomicU64::new(0),
                maintenance: Mutex::new(()),
                transfer: RwLock::new(None),
                registry,
                closed: AtomicBool::new(false),
            }
        });

        if let Some(dir) = &cache.directory {
            cache.restore_from_disk(dir);
        }
        cache
    }

    fn restore_from_disk(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping restore of {}: {}", dir.display(), e);
                return;
            }
        };

        let mut restored = 0usize;
        {
            let pieces = self.pieces.read();
            for entry in entries.flatten() {
                let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                else {
                    continue;
                };
                let Some(piece) = pieces.get(id as usize) else {
                    debug!("Ignoring piece file {} outside torrent {}", id, self.info_hash);
                    continue;
                };
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }

                let accessed = metadata.modified().unwrap_or_else(|_| SystemTime::now());
                piece.restore(metadata.len(), accessed);
                restored += 1;
            }
        }

        let filled = self.recompute_filled();
        info!(
            "Restored {} pieces ({} bytes) for {} from {}",
            restored,
            filled,
            self.info_hash,
            dir.display()
        );
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Bytes held as of the last maintenance pass or snapshot.
    pub fn filled(&self) -> u64 {
        self.filled.load(Ordering::Acquire)
    }

    pub fn piece_length(&self) -> u64 {
        self.layout.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.layout.piece_count
    }

    /// Whether pieces are backed by files.
    pub fn is_disk(&self) -> bool {
        self.directory.is_some()
    }

    /// Directory holding this torrent's piece files in disk mode.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attaches the transfer engine that downloads this torrent.
    pub fn set_transfer(&self, transfer: Arc<dyn TransferHandle>) {
        *self.transfer.write() = Some(transfer);
    }

    fn transfer(&self) -> Option<Arc<dyn TransferHandle>> {
        self.transfer.read().clone()
    }

    /// Storage of a piece for the transfer engine.
    ///
    /// # Errors
    ///
    /// - `CacheError::Closed` - If the cache has been closed
    /// - `CacheError::PieceOutOfRange` - If the index is outside the torrent
    pub fn piece(&self, index: PieceIndex) -> Result<Arc<Piece>, CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed {
                info_hash: self.info_hash,
            });
        }
        self.piece_at(index.as_u32()).ok_or(CacheError::PieceOutOfRange {
            index: index.as_u32(),
            count: self.layout.piece_count,
        })
    }

    fn piece_at(&self, index: u32) -> Option<Arc<Piece>> {
        self.pieces.read().get(index as usize).cloned()
    }

    fn recompute_filled(&self) -> u64 {
        let filled = self.pieces.read().iter().map(|piece| piece.size()).sum();
        self.filled.store(filled, Ordering::Release);
        filled
    }

    /// Releases all state and deregisters from the owning registry.
    ///
    /// Piece files of a disk cache stay on disk for the next run, with
    /// incomplete ones cut back to the bytes written from their start. Calling
    /// `close` again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Close cache for {}", self.info_hash);

        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.info_hash);
        }

        let pieces = std::mem::take(&mut *self.pieces.write());
        for piece in pieces.iter() {
            if piece.is_disk_backed() {
                piece.trim_to_written();
            } else {
                piece.release();
            }
        }
        drop(pieces);

        let readers = std::mem::take(&mut *self.readers.lock());
        for reader in readers.values() {
            reader.mark_closed();
        }

        self.filled.store(0, Ordering::Release);
        self.release_memory();
    }

    /// Applies a new read-ahead to every reader.
    ///
    /// Without a configured capacity the cache is resized to three times the
    /// read-ahead.
    pub fn adjust_readahead(&self, readahead: u64) {
        if self.configured_capacity == 0 {
            self.capacity.store(readahead.saturating_mul(3), Ordering::Release);
        }
        let readers = self.readers.lock();
        for reader in readers.values() {
            reader.set_readahead(readahead);
        }
        debug!(
            "Read-ahead for {} set to {} bytes on {} readers",
            self.info_hash,
            readahead,
            readers.len()
        );
    }

    /// Number of live readers.
    pub fn readers(&self) -> usize {
        self.readers.lock().len()
    }

    /// Registers a reader for `file`, positioned at the start of the file.
    ///
    /// # Errors
    ///
    /// - `CacheError::Closed` - If the cache has been closed
    pub fn new_reader(self: &Arc<Self>, file: TorrentFile) -> Result<Arc<Reader>, CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed {
                info_hash: self.info_hash,
            });
        }

        let id = ReaderId(self.next_reader_id.fetch_add(1, Ordering::Relaxed));
        let reader = Arc::new(Reader::new(
            id,
            file,
            self.layout.piece_length,
            self.capacity(),
            self.read_ahead_percent,
            Arc::downgrade(self),
        ));
        self.readers.lock().insert(id, Arc::clone(&reader));
        debug!(
            "Opened {} on {} for {}",
            id,
            reader.file().path,
            self.info_hash
        );

        self.run_maintenance();
        Ok(reader)
    }

    /// Opens a reader for the file at one-based `file_index`.
    ///
    /// # Errors
    ///
    /// - `CacheError::TransferDetached` - If no transfer handle is attached
    /// - `CacheError::FileIndexOutOfRange` - If the index names no file
    /// - `CacheError::Closed` - If the cache has been closed
    pub fn open_stream(self: &Arc<Self>, file_index: usize) -> Result<Arc<Reader>, CacheError> {
        let transfer = self.transfer().ok_or(CacheError::TransferDetached)?;
        let files = transfer.files();
        let count = files.len();
        let file = file_index
            .checked_sub(1)
            .and_then(|index| files.into_iter().nth(index))
            .ok_or(CacheError::FileIndexOutOfRange {
                index: file_index,
                count,
            })?;
        self.new_reader(file)
    }

    /// Removes a reader and schedules priority relaxation.
    pub fn close_reader(self: &Arc<Self>, reader: &Reader) {
        if !reader.mark_closed() {
            return;
        }
        let removed = self.readers.lock().remove(&reader.id()).is_some();
        if removed {
            debug!("Closed {} for {}", reader.id(), self.info_hash);
            self.schedule_priority_update();
        }
    }

    /// Produces a best-effort snapshot without waiting for maintenance.
    pub fn state(&self) -> CacheState {
        let mut pieces = BTreeMap::new();
        let mut filled = 0u64;
        for piece in self.pieces.read().iter() {
            let size = piece.size();
            if size == 0 {
                continue;
            }
            filled += size;
            pieces.insert(
                piece.id(),
                ItemState {
                    id: piece.id(),
                    size,
                    length: piece.length(),
                    completed: piece.is_complete(),
                },
            );
        }

        let mut readers: Vec<ReaderState> = self
            .readers
            .lock()
            .values()
            .map(|reader| {
                let window = reader.pieces_range();
                ReaderState {
                    start: window.start,
                    end: window.end,
                    reader: reader.reader_piece(),
                }
            })
            .collect();
        readers.sort_by_key(|reader| (reader.start, reader.end, reader.reader));

        self.filled.store(filled, Ordering::Release);
        CacheState {
            hash: self.info_hash.to_hex(),
            capacity: self.capacity(),
            filled,
            pieces_length: self.layout.piece_length,
            pieces_count: self.layout.piece_count,
            pieces,
            readers,
        }
    }

    /// Called by a piece when its first bytes are stored.
    pub(crate) fn piece_written(&self) {
        self.run_maintenance();
    }

    fn run_maintenance(&self) {
        self.clean_pieces();
        if self.is_disk() {
            self.load_pieces_on_disk();
        }
    }

    /// Evicts the least recently accessed unneeded pieces while over capacity.
    ///
    /// Returns immediately if another maintenance pass is running.
    pub fn clean_pieces(&self) {
        let Some(_guard) = self.maintenance.try_lock() else {
            trace!("Maintenance already running for {}", self.info_hash);
            return;
        };
        if self.is_closed() {
            return;
        }

        let candidates = self.removable_pieces();
        let capacity = self.capacity();
        let mut filled = self.filled();
        if filled <= capacity {
            return;
        }

        debug!(
            "Cache {} over capacity by {} bytes ({} eviction candidates)",
            self.info_hash,
            filled - capacity,
            candidates.len()
        );

        let mut evicted = 0usize;
        for piece in candidates {
            if filled <= capacity {
                break;
            }
            filled = filled.saturating_sub(piece.release());
            evicted += 1;
        }
        self.filled.store(filled, Ordering::Release);

        if filled <= capacity {
            debug!(
                "Evicted {} pieces from {}, {} of {} bytes used",
                evicted, self.info_hash, filled, capacity
            );
            self.release_memory();
        } else {
            debug!(
                "Evicted {} pieces from {}, still {} bytes over capacity",
                evicted,
                self.info_hash,
                filled - capacity
            );
        }
    }

    /// Pieces eligible for eviction, oldest access first.
    ///
    /// Recomputes `filled` and raises the priority of the pieces in front of
    /// every reader as a side effect.
    fn removable_pieces(&self) -> Vec<Arc<Piece>> {
        let snapshots = self.reader_windows();
        let files = distinct_files(&snapshots);
        let windows = merge_windows(snapshots.iter().map(|(window, _)| window.clone()).collect());

        let mut candidates = Vec::new();
        let mut filled = 0u64;
        for piece in self.pieces.read().iter() {
            let size = piece.size();
            if size == 0 {
                continue;
            }
            filled += size;
            if !windows.is_empty()
                && !in_windows(&windows, piece.id())
                && !self.in_protected_zone(&files, piece.id())
            {
                candidates.push(Arc::clone(piece));
            }
        }
        self.filled.store(filled, Ordering::Release);

        if let Some(transfer) = self.transfer() {
            for (window, current) in &snapshots {
                if self.in_protected_zone(&files, *current) {
                    continue;
                }
                self.prefetch(transfer.as_ref(), *current, window.end);
            }
        }

        candidates.sort_by_cached_key(|piece| piece.accessed());
        candidates
    }

    /// Whether `index` holds bytes near the start or end of any of `files`.
    fn in_protected_zone(&self, files: &[TorrentFile], index: u32) -> bool {
        files.iter().any(|file| {
            let zone = self.protected_zone.min(file.length);
            if zone == 0 {
                return false;
            }
            let head = (
                self.layout.piece_of(file.offset),
                self.layout.piece_of(file.offset + zone - 1),
            );
            let tail = (
                self.layout.piece_of(file.end() - zone),
                self.layout.piece_of(file.end() - 1),
            );
            (head.0..=head.1).contains(&index) || (tail.0..=tail.1).contains(&index)
        })
    }

    /// Raises up to `PREFETCH_LIMIT` incomplete pieces in `from..=until` to normal priority.
    fn prefetch(&self, transfer: &dyn TransferHandle, from: u32, until: u32) -> usize {
        let last = until.min(self.layout.piece_count.saturating_sub(1));
        let mut remaining = PREFETCH_LIMIT;
        let mut raised = 0usize;
        let mut index = from;

        while index <= last && remaining > 0 {
            let Some(piece) = self.piece_at(index) else {
                break;
            };
            if !piece.is_complete() {
                let piece_index = PieceIndex::new(index);
                if transfer.piece_priority(piece_index) == PiecePriority::None {
                    transfer.set_piece_priority(piece_index, PiecePriority::Normal);
                    raised += 1;
                }
                remaining -= 1;
            }
            index += 1;
        }

        if raised > 0 {
            trace!(
                "Raised {} pieces from {} for {}",
                raised, from, self.info_hash
            );
        }
        raised
    }

    /// Keeps a disk cache downloading ahead of current or future readers.
    ///
    /// Without readers the first incomplete piece from the start of the
    /// torrent is where a future playback will begin.
    pub fn load_pieces_on_disk(&self) {
        if !self.is_disk() {
            return;
        }
        let Some(transfer) = self.transfer() else {
            return;
        };
        let Some(_guard) = self.maintenance.try_lock() else {
            trace!("Maintenance already running for {}", self.info_hash);
            return;
        };
        if self.is_closed() || self.layout.piece_count == 0 {
            return;
        }

        let last = self.layout.piece_count - 1;
        let snapshots = self.reader_windows();
        if snapshots.is_empty() {
            // TODO: resume from the last boosted piece instead of rescanning
            // from piece 0 once large torrents show up in profiles.
            let first_incomplete = (0..self.layout.piece_count)
                .find(|&index| self.piece_at(index).is_some_and(|piece| !piece.is_complete()));
            if let Some(start) = first_incomplete {
                self.prefetch(transfer.as_ref(), start, last);
            }
        } else {
            for (_, current) in snapshots {
                self.prefetch(transfer.as_ref(), current, last);
            }
        }
    }

    fn schedule_priority_update(self: &Arc<Self>) {
        let cache = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(PRIORITY_RELAX_DELAY).await;
                    if let Some(cache) = cache.upgrade() {
                        cache.update_priority();
                    }
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(PRIORITY_RELAX_DELAY);
                    if let Some(cache) = cache.upgrade() {
                        cache.update_priority();
                    }
                });
            }
        }
    }

    /// Demotes every piece outside the remaining readers' windows to no priority.
    pub fn update_priority(&self) {
        if self.is_closed() {
            return;
        }
        let Some(transfer) = self.transfer() else {
            return;
        };

        let windows = merge_windows(
            self.reader_windows()
                .into_iter()
                .map(|(window, _)| window)
                .collect(),
        );

        let mut relaxed = 0usize;
        for index in 0..self.layout.piece_count {
            if in_windows(&windows, index) {
                continue;
            }
            let piece_index = PieceIndex::new(index);
            if transfer.piece_priority(piece_index) != PiecePriority::None {
                transfer.set_piece_priority(piece_index, PiecePriority::None);
                relaxed += 1;
            }
        }
        debug!(
            "Relaxed priority of {} pieces for {} ({} windows)",
            relaxed,
            self.info_hash,
            windows.len()
        );
    }

    /// Window and current piece of every live reader.
    fn reader_windows(&self) -> Vec<(PieceWindow, u32)> {
        self.readers
            .lock()
            .values()
            .map(|reader| (reader.pieces_range(), reader.reader_piece()))
            .collect()
    }

    fn release_memory(&self) {
        self.readers.lock().shrink_to_fit();
        trace!("Released memory for {}", self.info_hash);
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("info_hash", &self.info_hash)
            .field("capacity", &self.capacity())
            .field("filled", &self.filled())
            .field("piece_length", &self.layout.piece_length)
            .field("piece_count", &self.layout.piece_count)
            .field("disk", &self.is_disk())
            .finish_non_exhaustive()
    }
}

fn distinct_files(snapshots: &[(PieceWindow, u32)]) -> Vec<TorrentFile> {
    let mut files: Vec<TorrentFile> = Vec::new();
    for (window, _) in snapshots {
        if !files.contains(&window.file) {
            files.push(window.file.clone());
        }
    }
    files
}
