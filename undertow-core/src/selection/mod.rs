//! Playable file selection for multi-file torrents.
//!
//! [`FileSelector`] filters a file table down to playable candidates by size,
//! disc layout and archive detection, then narrows episodic content to a
//! single file by filename matching before falling back to asking the user.

pub mod candidates;
pub mod collaborators;
pub mod episodes;

use serde::{Deserialize, Serialize};

pub use candidates::{CandidateFile, CandidateSet, FileSelector, Selection};
pub use collaborators::{
    DecliningPrompt, MatchHistory, NoHistory, NoShowMetadata, SelectionPrompt, ShowMetadata,
};

/// What is known about the media a torrent is played for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaHint {
    pub show_id: Option<u64>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Engine file index to open, bypassing selection
    pub original_index: Option<usize>,
    /// Position in the candidate list to open
    pub file_index: Option<usize>,
    pub absolute_number: Option<u32>,
    pub title: Option<String>,
}

impl MediaHint {
    /// Season and episode when both are known and non-zero.
    pub fn episode_number(&self) -> Option<(u32, u32)> {
        match (self.season, self.episode) {
            (Some(season), Some(episode)) if season > 0 && episode > 0 => Some((season, episode)),
            _ => None,
        }
    }

    pub fn is_episode(&self) -> bool {
        self.episode.is_some_and(|episode| episode > 0)
    }
}

/// Errors from candidate selection.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("User cancelled file selection")]
    UserCancelled,

    #[error("Archive download declined: {path}")]
    ArchiveDeclined { path: String },

    #[error("No playable file found")]
    NotFound,

    #[error("Invalid filename pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
