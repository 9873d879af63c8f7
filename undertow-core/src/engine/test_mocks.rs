//! Mock implementations of the engine traits for testing.
//!
//! Every mutation is recorded in call order so tests can assert both what the
//! scheduler asked for and what it must not have asked for.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{
    EngineFile, EngineMetadata, EngineSession, MemoryStorage, PartialPiece, PiecePriority,
    PieceSnapshot, SwarmStatus, TorrentEngine,
};
use crate::streaming::memory::{MemoryProbe, MemoryStats};
use crate::torrent::{Bitfield, InfoHash, TorrentError};

static NEXT_HASH_SEED: AtomicU8 = AtomicU8::new(1);

/// One recorded engine mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Priority(u32, PiecePriority),
    Deadline(u32, u32),
    ClearDeadlines,
    /// Full vector push, with its length
    Prioritize(usize),
    FilePriority(usize, PiecePriority),
    Pause,
    Resume,
    Reannounce,
    DhtAnnounce,
}

/// Mock torrent engine with a scriptable completion state.
#[derive(Debug)]
pub struct MockEngine {
    info_hash: InfoHash,
    metadata: EngineMetadata,
    metadata_visible: AtomicBool,
    valid: AtomicBool,
    raw_state: AtomicU8,
    completed: Mutex<Vec<bool>>,
    queue: Mutex<Vec<PartialPiece>>,
    status: Mutex<SwarmStatus>,
    calls: Mutex<Vec<EngineCall>>,
    last_vector: Mutex<Vec<PiecePriority>>,
    bitfield_queries: AtomicUsize,
    storage: Option<Arc<MockMemoryStorage>>,
}

impl MockEngine {
    /// Creates a single-file torrent of `piece_count` full pieces.
    pub fn with_pieces(piece_count: u32, piece_length: u64) -> Self {
        let size = u64::from(piece_count) * piece_length;
        Self::with_files(piece_length, &[("content.mkv", size)])
    }

    /// Creates a torrent with the given files laid out back to back.
    pub fn with_files(piece_length: u64, files: &[(&str, u64)]) -> Self {
        let mut offset = 0;
        let files: Vec<EngineFile> = files
            .iter()
            .enumerate()
            .map(|(index, (path, size))| {
                let file = EngineFile::new(index, *path, *size, offset);
                offset += size;
                file
            })
            .collect();

        let total_size = offset;
        let piece_count = total_size.div_ceil(piece_length.max(1)) as u32;
        let seed = NEXT_HASH_SEED.fetch_add(1, Ordering::Relaxed);

        Self {
            info_hash: InfoHash::new([seed; 20]),
            metadata: EngineMetadata {
                name: "mock torrent".to_string(),
                piece_length,
                piece_count,
                total_size,
                files,
            },
            metadata_visible: AtomicBool::new(true),
            valid: AtomicBool::new(true),
            raw_state: AtomicU8::new(3),
            completed: Mutex::new(vec![false; piece_count as usize]),
            queue: Mutex::new(Vec::new()),
            status: Mutex::new(SwarmStatus::default()),
            calls: Mutex::new(Vec::new()),
            last_vector: Mutex::new(Vec::new()),
            bitfield_queries: AtomicUsize::new(0),
            storage: None,
        }
    }

    /// Attaches a memory-backed storage window.
    pub fn with_memory_storage(mut self) -> Self {
        self.storage = Some(Arc::new(MockMemoryStorage::default()));
        self
    }

    /// Hides metadata until [`MockEngine::reveal_metadata`] is called.
    pub fn without_metadata(self) -> Self {
        self.metadata_visible.store(false, Ordering::SeqCst);
        self
    }

    pub fn reveal_metadata(&self) {
        self.metadata_visible.store(true, Ordering::SeqCst);
    }

    pub fn complete_piece(&self, piece: u32) {
        if let Some(done) = self.completed.lock().get_mut(piece as usize) {
            *done = true;
        }
        self.queue.lock().retain(|partial| partial.index != piece);
    }

    pub fn complete_all(&self) {
        self.completed.lock().iter_mut().for_each(|done| *done = true);
        self.queue.lock().clear();
    }

    /// Puts a piece in the download queue with the given progress.
    pub fn set_partial(&self, piece: u32, bytes_downloaded: u64) {
        let mut queue = self.queue.lock();
        queue.retain(|partial| partial.index != piece);
        queue.push(PartialPiece {
            index: piece,
            bytes_downloaded,
            bytes_total: self.metadata.piece_length,
        });
    }

    pub fn set_raw_state(&self, state: u8) {
        self.raw_state.store(state, Ordering::SeqCst);
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: SwarmStatus) {
        *self.status.lock() = status;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of mutations recorded so far.
    pub fn mutation_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn prioritize_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, EngineCall::Prioritize(_)))
            .count()
    }

    /// Last full priority vector pushed.
    pub fn last_priorities(&self) -> Vec<PiecePriority> {
        self.last_vector.lock().clone()
    }

    pub fn deadlines(&self) -> Vec<(u32, u32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::Deadline(piece, ms) => Some((*piece, *ms)),
                _ => None,
            })
            .collect()
    }

    /// Most recent single-piece priority set for `piece`.
    pub fn piece_priority(&self, piece: u32) -> Option<PiecePriority> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            EngineCall::Priority(index, priority) if *index == piece => Some(*priority),
            _ => None,
        })
    }

    pub fn bitfield_queries(&self) -> usize {
        self.bitfield_queries.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> Option<Arc<MockMemoryStorage>> {
        self.storage.clone()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

impl TorrentEngine for MockEngine {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn metadata(&self) -> Option<EngineMetadata> {
        self.metadata_visible
            .load(Ordering::SeqCst)
            .then(|| self.metadata.clone())
    }

    fn set_piece_priority(&self, piece: u32, priority: PiecePriority) {
        self.record(EngineCall::Priority(piece, priority));
    }

    fn set_piece_deadline(&self, piece: u32, deadline_ms: u32) {
        self.record(EngineCall::Deadline(piece, deadline_ms));
    }

    fn clear_piece_deadlines(&self) {
        self.record(EngineCall::ClearDeadlines);
    }

    fn prioritize_pieces(&self, priorities: &[PiecePriority]) {
        *self.last_vector.lock() = priorities.to_vec();
        self.record(EngineCall::Prioritize(priorities.len()));
    }

    fn set_file_priority(&self, file_index: usize, priority: PiecePriority) {
        self.record(EngineCall::FilePriority(file_index, priority));
    }

    fn piece_bitfield(&self) -> Result<PieceSnapshot, TorrentError> {
        self.bitfield_queries.fetch_add(1, Ordering::SeqCst);
        let bits = Bitfield::from_flags(&self.completed.lock());
        Ok(PieceSnapshot {
            state: self.raw_state.load(Ordering::SeqCst),
            len: bits.len(),
            bits: bits.as_bytes().to_vec(),
        })
    }

    fn download_queue(&self) -> Vec<PartialPiece> {
        self.queue.lock().clone()
    }

    fn status(&self) -> Result<SwarmStatus, TorrentError> {
        Ok(*self.status.lock())
    }

    fn pause(&self) {
        self.record(EngineCall::Pause);
    }

    fn resume(&self) {
        self.record(EngineCall::Resume);
    }

    fn force_reannounce(&self) {
        self.record(EngineCall::Reannounce);
    }

    fn force_dht_announce(&self) {
        self.record(EngineCall::DhtAnnounce);
    }

    fn memory_storage(&self) -> Option<Arc<dyn MemoryStorage>> {
        self.storage
            .clone()
            .map(|storage| storage as Arc<dyn MemoryStorage>)
    }
}

/// Mock memory storage recording the last values pushed.
#[derive(Debug, Default)]
pub struct MockMemoryStorage {
    memory_size: AtomicU64,
    reader_pieces: Mutex<Vec<u32>>,
    reserved_pieces: Mutex<Vec<u32>>,
    updates: AtomicUsize,
}

impl MockMemoryStorage {
    pub fn memory_size(&self) -> u64 {
        self.memory_size.load(Ordering::SeqCst)
    }

    pub fn reader_pieces(&self) -> Vec<u32> {
        self.reader_pieces.lock().clone()
    }

    pub fn reserved_pieces(&self) -> Vec<u32> {
        self.reserved_pieces.lock().clone()
    }

    /// Number of reader/reserved piece pushes.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl MemoryStorage for MockMemoryStorage {
    fn set_memory_size(&self, bytes: u64) {
        self.memory_size.store(bytes, Ordering::SeqCst);
    }

    fn set_reader_pieces(&self, pieces: &[u32]) {
        *self.reader_pieces.lock() = pieces.to_vec();
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn set_reserved_pieces(&self, pieces: &[u32]) {
        *self.reserved_pieces.lock() = pieces.to_vec();
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock engine session.
#[derive(Debug, Default)]
pub struct MockEngineSession {
    paused: AtomicBool,
    limits_applied: AtomicUsize,
    limits_restored: AtomicUsize,
    removed: Mutex<Vec<(InfoHash, bool)>>,
}

impl MockEngineSession {
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn limits_applied(&self) -> usize {
        self.limits_applied.load(Ordering::SeqCst)
    }

    pub fn limits_restored(&self) -> usize {
        self.limits_restored.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<(InfoHash, bool)> {
        self.removed.lock().clone()
    }
}

impl EngineSession for MockEngineSession {
    fn apply_buffering_limits(&self) {
        self.limits_applied.fetch_add(1, Ordering::SeqCst);
    }

    fn restore_limits(&self) {
        self.limits_restored.fetch_add(1, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn remove_torrent(&self, info_hash: InfoHash, remove_files: bool) -> Result<(), TorrentError> {
        self.removed.lock().push((info_hash, remove_files));
        Ok(())
    }
}

/// Memory probe returning fixed figures.
#[derive(Debug)]
pub struct MockMemoryProbe {
    stats: Mutex<MemoryStats>,
}

impl MockMemoryProbe {
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            stats: Mutex::new(MemoryStats { total, free }),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.stats.lock().free = free;
    }
}

impl MemoryProbe for MockMemoryProbe {
    fn memory_stats(&self) -> MemoryStats {
        *self.stats.lock()
    }
}

/// Per-piece priorities recorded through single-piece calls, latest wins.
pub fn piece_priorities(calls: &[EngineCall]) -> HashMap<u32, PiecePriority> {
    calls
        .iter()
        .filter_map(|call| match call {
            EngineCall::Priority(piece, priority) => Some((*piece, *priority)),
            _ => None,
        })
        .collect()
}
