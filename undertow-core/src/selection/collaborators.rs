//! External collaborators consulted during selection.

use async_trait::async_trait;

use super::MediaHint;
use super::candidates::CandidateFile;

/// Show metadata lookups.
#[async_trait]
pub trait ShowMetadata: Send + Sync {
    /// Known episode runtimes of a show in minutes.
    async fn episode_runtimes(&self, show_id: u64) -> Option<Vec<u32>>;

    /// Absolute episode number for shows numbered across seasons.
    async fn absolute_episode_number(&self, show_id: u64, season: u32, episode: u32)
    -> Option<u32>;
}

/// Interactive decisions delegated to the user.
#[async_trait]
pub trait SelectionPrompt: Send + Sync {
    /// Asks whether to download an archive that must complete before playback.
    async fn confirm_archive(&self, path: &str) -> bool;

    /// Asks to pick one of `items`; `None` means cancelled.
    async fn choose(&self, title: &str, items: &[String]) -> Option<usize>;
}

/// Store of discovered episode matches.
#[async_trait]
pub trait MatchHistory: Send + Sync {
    async fn record(&self, hint: &MediaHint, candidates: &[CandidateFile]);
}

/// Metadata source that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShowMetadata;

#[async_trait]
impl ShowMetadata for NoShowMetadata {
    async fn episode_runtimes(&self, _show_id: u64) -> Option<Vec<u32>> {
        None
    }

    async fn absolute_episode_number(
        &self,
        _show_id: u64,
        _season: u32,
        _episode: u32,
    ) -> Option<u32> {
        None
    }
}

/// Non-interactive prompt: declines archives and cancels choices.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecliningPrompt;

#[async_trait]
impl SelectionPrompt for DecliningPrompt {
    async fn confirm_archive(&self, _path: &str) -> bool {
        false
    }

    async fn choose(&self, _title: &str, _items: &[String]) -> Option<usize> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

#[async_trait]
impl MatchHistory for NoHistory {
    async fn record(&self, _hint: &MediaHint, _candidates: &[CandidateFile]) {}
}
