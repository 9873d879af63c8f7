//! Torrent-level primitives shared by the streaming scheduler
//!
//! Identifiers, engine states, piece geometry and the completion view. Nothing
//! in here talks to the engine except [`completion::CompletionView`].

pub mod completion;
pub mod files;
pub mod layout;
pub mod piece_set;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use completion::{Bitfield, CompletionView};
pub use files::{FileTable, TorrentFile};
pub use layout::{BufferWindow, PieceLayout, PieceRange};
pub use piece_set::PieceSet;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Displayed and parsed as
/// lowercase hex, which is also how persisted artifacts are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| TorrentError::InvalidInfoHash {
            reason: e.to_string(),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| TorrentError::InvalidInfoHash {
                reason: format!("expected 20 bytes, got {}", bytes.len()),
            })?;
        Ok(Self(hash))
    }
}

/// Engine-reported lifecycle state of a torrent.
///
/// Discriminants match the raw values engines report in status snapshots.
/// Anything past [`TorrentState::Seeding`] is treated as invalid by the
/// completion view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TorrentState {
    Queued = 0,
    Checking = 1,
    Finding = 2,
    Downloading = 3,
    Finished = 4,
    Seeding = 5,
}

impl TorrentState {
    /// Human readable label used in status reporting.
    pub fn label(self) -> &'static str {
        match self {
            TorrentState::Queued => "Queued",
            TorrentState::Checking => "Checking",
            TorrentState::Finding => "Finding",
            TorrentState::Downloading => "Downloading",
            TorrentState::Finished => "Finished",
            TorrentState::Seeding => "Seeding",
        }
    }
}

impl TryFrom<u8> for TorrentState {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TorrentState::Queued),
            1 => Ok(TorrentState::Checking),
            2 => Ok(TorrentState::Finding),
            3 => Ok(TorrentState::Downloading),
            4 => Ok(TorrentState::Finished),
            5 => Ok(TorrentState::Seeding),
            state => Err(TorrentError::InvalidState { state }),
        }
    }
}

/// Errors that can occur while driving a torrent session.
///
/// Engine read failures on status paths are swallowed by callers; these
/// variants surface only where a caller can act on them.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Torrent {info_hash} has no metadata yet")]
    NotReady { info_hash: InfoHash },

    #[error("Torrent reported invalid state {state}")]
    InvalidState { state: u8 },

    #[error("Timed out after {timeout:?} resolving metadata for {info_hash}")]
    MetadataTimeout {
        info_hash: InfoHash,
        timeout: Duration,
    },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },

    #[error("Engine error: {reason}")]
    Engine { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
