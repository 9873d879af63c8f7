//! Undertow Core - Streaming buffer and piece-priority scheduling
//!
//! Lets playback start before a torrent finishes downloading: buffers the
//! head and tail of the chosen file, keeps piece priorities in step with open
//! readers, and picks the playable file of multi-file torrents. The torrent
//! engine itself sits behind the traits in [`engine`].

pub mod config;
pub mod engine;
pub mod selection;
pub mod service;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

pub use config::UndertowConfig;
pub use engine::{EngineSession, MemoryStorage, PiecePriority, TorrentEngine};
pub use selection::{FileSelector, MediaHint, SelectionError};
pub use service::StreamingService;
pub use streaming::{ReaderHandle, TorrentSession};
pub use torrent::{InfoHash, TorrentError};

/// Errors surfaced by Undertow to callers.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::NotReady { .. } => "Torrent information is still loading".to_string(),
                TorrentError::MetadataTimeout { timeout, .. } => {
                    format!("Torrent information not found within {}s", timeout.as_secs())
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::InvalidInfoHash { reason } => format!("Invalid info hash: {reason}"),
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Selection(e) => match e {
                SelectionError::UserCancelled => "File selection cancelled".to_string(),
                SelectionError::ArchiveDeclined { .. } => {
                    "Archive download was declined".to_string()
                }
                SelectionError::NotFound => "No playable file found".to_string(),
                SelectionError::InvalidPattern(_) => "File matching failed".to_string(),
            },
            UndertowError::Configuration { .. } => "Configuration error occurred".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error stems from a user decision or user input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(TorrentError::InvalidInfoHash { .. })
                | UndertowError::Selection(
                    SelectionError::UserCancelled | SelectionError::ArchiveDeclined { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
