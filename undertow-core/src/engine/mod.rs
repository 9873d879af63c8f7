//! Capability surface of the underlying torrent engine
//!
//! The scheduler never speaks the peer wire protocol. It drives an engine
//! through these traits: per-torrent piece priorities and deadlines, the
//! optional memory-backed storage window, and session-wide limits.
//! Engine calls are synchronous and expected to be cheap.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::sync::Arc;

use crate::torrent::{InfoHash, TorrentError, TorrentState};

/// Download priority of a single piece.
///
/// Discriminants are the levels pushed to the engine, from 0 (not needed)
/// to 7 (deadline now).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum PiecePriority {
    #[default]
    Skip = 0,
    /// Eventually, for chosen files on disk-backed storage
    Background = 1,
    /// Tail of a reader's readahead window
    Trailing = 2,
    /// Outstanding buffer demand and the middle of a readahead window
    Demand = 3,
    Near = 4,
    Next = 5,
    /// Piece under a reader's cursor
    Head = 6,
    /// A reader is blocked on this piece
    Overdue = 7,
}

impl PiecePriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// File entry as reported by the engine's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFile {
    pub index: usize,
    pub path: String,
    pub size: u64,
    pub offset: u64,
}

impl EngineFile {
    pub fn new(index: usize, path: impl Into<String>, size: u64, offset: u64) -> Self {
        Self {
            index,
            path: path.into(),
            size,
            offset,
        }
    }
}

/// Torrent metadata as resolved by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMetadata {
    pub name: String,
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_size: u64,
    pub files: Vec<EngineFile>,
}

/// Raw completion bitmap copied out of the engine.
///
/// `state` is the engine's raw lifecycle value, validated by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceSnapshot {
    pub state: u8,
    pub bits: Vec<u8>,
    pub len: u32,
}

/// A piece currently being downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialPiece {
    pub index: u32,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

impl PartialPiece {
    /// Downloaded fraction of the piece in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.bytes_total as f64).min(1.0)
    }
}

/// Transfer and connection snapshot for one torrent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwarmStatus {
    pub state: TorrentState,
    /// Fraction of wanted bytes downloaded, `0.0..=1.0`
    pub progress: f64,
    pub paused: bool,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_seeds: u32,
    pub connected_peers: u32,
    /// Swarm-wide complete count from scrape, when known
    pub scrape_complete: Option<u32>,
    pub scrape_incomplete: Option<u32>,
    pub list_seeds: u32,
    pub list_peers: u32,
}

impl Default for SwarmStatus {
    fn default() -> Self {
        Self {
            state: TorrentState::Queued,
            progress: 0.0,
            paused: false,
            download_rate: 0,
            upload_rate: 0,
            connected_seeds: 0,
            connected_peers: 0,
            scrape_complete: None,
            scrape_incomplete: None,
            list_seeds: 0,
            list_peers: 0,
        }
    }
}

/// Per-torrent operations of the engine.
pub trait TorrentEngine: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// False once the engine has dropped its handle for this torrent.
    fn is_valid(&self) -> bool;

    /// Resolved metadata, `None` while a magnet link is still resolving.
    fn metadata(&self) -> Option<EngineMetadata>;

    fn has_metadata(&self) -> bool {
        self.metadata().is_some()
    }

    fn set_piece_priority(&self, piece: u32, priority: PiecePriority);

    /// Requests `piece` within `deadline_ms` milliseconds.
    fn set_piece_deadline(&self, piece: u32, deadline_ms: u32);

    fn clear_piece_deadlines(&self);

    /// Replaces the whole priority vector in one call.
    fn prioritize_pieces(&self, priorities: &[PiecePriority]);

    fn set_file_priority(&self, file_index: usize, priority: PiecePriority);

    /// Batch completion query.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Engine` - The engine could not produce a snapshot
    fn piece_bitfield(&self) -> Result<PieceSnapshot, TorrentError>;

    fn download_queue(&self) -> Vec<PartialPiece>;

    /// # Errors
    ///
    /// - `TorrentError::Engine` - The engine could not produce a status
    fn status(&self) -> Result<SwarmStatus, TorrentError>;

    fn pause(&self);

    fn resume(&self);

    fn force_reannounce(&self);

    fn force_dht_announce(&self);

    /// Memory-backed storage of this torrent, if the session uses one.
    fn memory_storage(&self) -> Option<Arc<dyn MemoryStorage>>;
}

/// Bounded in-memory piece window of a torrent.
pub trait MemoryStorage: Send + Sync {
    fn set_memory_size(&self, bytes: u64);

    /// Pieces readers currently depend on; never evicted.
    fn set_reader_pieces(&self, pieces: &[u32]);

    /// Pieces pinned regardless of reader position.
    fn set_reserved_pieces(&self, pieces: &[u32]);
}

/// Session-wide engine operations shared by all torrents.
pub trait EngineSession: Send + Sync {
    /// Tightens connection and rate limits in favour of the buffering torrent.
    fn apply_buffering_limits(&self);

    fn restore_limits(&self);

    fn is_paused(&self) -> bool;

    /// Removes a torrent from the engine, optionally deleting its data.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - The engine does not know the torrent
    fn remove_torrent(&self, info_hash: InfoHash, remove_files: bool) -> Result<(), TorrentError>;
}
