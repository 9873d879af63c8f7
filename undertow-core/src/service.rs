//! Streaming service: owns sessions and their watch loops.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UndertowConfig;
use crate::engine::{EngineSession, TorrentEngine};
use crate::selection::{FileSelector, MediaHint, Selection};
use crate::streaming::{
    MemoryProbe, MemoryStats, MetadataWait, SessionContext, SessionOwner, TorrentSession,
    spawn_watch,
};
use crate::torrent::{InfoHash, TorrentError};

/// Entry point for streaming torrents.
///
/// Each added torrent gets a [`TorrentSession`] and a watch loop. Shutting the
/// service down cancels every session through a shared parent token.
pub struct StreamingService {
    config: Arc<UndertowConfig>,
    engine_session: Arc<dyn EngineSession>,
    memory_probe: Arc<dyn MemoryProbe>,
    selector: FileSelector,
    sessions: RwLock<HashMap<InfoHash, Arc<TorrentSession>>>,
    cancel: CancellationToken,
    this: Weak<StreamingService>,
}

impl StreamingService {
    pub fn new(
        config: UndertowConfig,
        engine_session: Arc<dyn EngineSession>,
        memory_probe: Arc<dyn MemoryProbe>,
        selector: FileSelector,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config: Arc::new(config),
            engine_session,
            memory_probe,
            selector,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Starts streaming the torrent behind `engine`. Adding a torrent twice
    /// returns the existing session.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Engine` - The service is shut down
    pub fn add_torrent(
        &self,
        engine: Arc<dyn TorrentEngine>,
    ) -> Result<Arc<TorrentSession>, TorrentError> {
        if self.is_shutdown() {
            return Err(TorrentError::Engine {
                reason: "streaming service is shut down".to_string(),
            });
        }

        let info_hash = engine.info_hash();
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&info_hash) {
            return Ok(Arc::clone(existing));
        }

        let session = TorrentSession::new(SessionContext {
            engine,
            engine_session: Arc::clone(&self.engine_session),
            memory_probe: Arc::clone(&self.memory_probe),
            config: Arc::clone(&self.config),
            parent: self.cancel.clone(),
        });

        let owner: Weak<dyn SessionOwner> = self.this.clone();
        spawn_watch(Arc::clone(&session), owner);

        info!("Added torrent {info_hash}");
        sessions.insert(info_hash, Arc::clone(&session));
        Ok(session)
    }

    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No session for `info_hash`
    pub fn session(&self, info_hash: InfoHash) -> Result<Arc<TorrentSession>, TorrentError> {
        self.sessions
            .read()
            .get(&info_hash)
            .cloned()
            .ok_or(TorrentError::TorrentNotFound { info_hash })
    }

    pub fn sessions(&self) -> Vec<Arc<TorrentSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Waits for a session's metadata within the configured timeout.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No session for `info_hash`
    /// - `TorrentError::MetadataTimeout` - Metadata did not arrive in time
    pub async fn wait_for_metadata(&self, info_hash: InfoHash) -> Result<MetadataWait, TorrentError> {
        let session = self.session(info_hash)?;
        session
            .wait_for_metadata(self.config.metadata.resolve_timeout)
            .await
    }

    /// Chooses the file to play and adds it to the session's chosen files.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Torrent` - Unknown torrent or metadata missing
    /// - `UndertowError::Selection` - Selection failed or was cancelled
    pub async fn choose_file(
        &self,
        info_hash: InfoHash,
        hint: Option<&MediaHint>,
    ) -> crate::Result<Selection> {
        let session = self.session(info_hash)?;
        session.layout()?;

        let selection = self.selector.choose(&session.files(), hint).await?;
        info!(
            "Chose file {} for {info_hash}",
            selection.file.path
        );
        session.download_file(&selection.file);
        Ok(selection)
    }

    /// Chooses a file, marks the session as playing and starts buffering.
    ///
    /// # Errors
    ///
    /// Same as [`StreamingService::choose_file`].
    pub async fn play(&self, info_hash: InfoHash, hint: Option<&MediaHint>) -> crate::Result<Selection> {
        let selection = self.choose_file(info_hash, hint).await?;
        let session = self.session(info_hash)?;
        session.set_playing(true);
        session.buffer(Some(&selection.file), true);
        Ok(selection)
    }

    /// Tears a session down; cleanup continues on the returned task.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No session for `info_hash`
    pub fn remove_torrent(
        &self,
        info_hash: InfoHash,
        remove_files: bool,
    ) -> Result<JoinHandle<()>, TorrentError> {
        let session = self
            .sessions
            .write()
            .remove(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;
        Ok(session.drop_torrent(remove_files))
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory_probe.memory_stats()
    }

    /// Cancels every session and waits for their cleanup.
    pub async fn shutdown(&self) {
        info!("Shutting down streaming service");
        self.cancel.cancel();

        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.drop_torrent(false).await {
                warn!("Cleanup of {} failed: {e}", session.info_hash());
            }
        }
    }
}

impl SessionOwner for StreamingService {
    fn release(&self, info_hash: InfoHash) {
        if let Err(e) = self.remove_torrent(info_hash, false) {
            warn!("Cannot release {info_hash}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::StorageKind;
    use crate::engine::test_mocks::{MockEngine, MockEngineSession, MockMemoryProbe};
    use crate::selection::{DecliningPrompt, NoHistory, NoShowMetadata};
    use crate::UndertowError;

    const MIB: u64 = 1024 * 1024;

    fn service(config: UndertowConfig) -> (Arc<StreamingService>, Arc<MockEngineSession>) {
        let engine_session = Arc::new(MockEngineSession::default());
        let selector = FileSelector::new(
            config.selection.clone(),
            Arc::new(NoShowMetadata),
            Arc::new(DecliningPrompt),
            Arc::new(NoHistory),
        );
        let service = StreamingService::new(
            config,
            engine_session.clone(),
            Arc::new(MockMemoryProbe::new(8192 * MIB, 4096 * MIB)),
            selector,
        );
        (service, engine_session)
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (service, _) = service(UndertowConfig::for_testing());
        let engine = Arc::new(MockEngine::with_pieces(16, MIB));

        let first = service.add_torrent(engine.clone()).unwrap();
        let second = service.add_torrent(engine).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_play_buffers_chosen_file() {
        let mut config = UndertowConfig::for_testing();
        config.storage.kind = StorageKind::File;
        let (service, engine_session) = service(config);
        let engine = Arc::new(MockEngine::with_files(
            MIB,
            &[("Movie/sample.mkv", 2 * MIB), ("Movie/movie.mkv", 60 * MIB)],
        ));
        let session = service.add_torrent(engine.clone()).unwrap();

        let selection = service.play(session.info_hash(), None).await.unwrap();

        assert_eq!(selection.file.path, "Movie/movie.mkv");
        assert!(session.is_playing());
        assert!(session.is_buffering());
        assert!(session.is_selected(1));
        assert_eq!(engine_session.limits_applied(), 1);
        assert_eq!(engine.prioritize_calls(), 1);
    }

    #[tokio::test]
    async fn test_choose_without_metadata_is_not_ready() {
        let (service, _) = service(UndertowConfig::for_testing());
        let engine = Arc::new(MockEngine::with_pieces(16, MIB).without_metadata());
        let session = service.add_torrent(engine).unwrap();

        let err = service.choose_file(session.info_hash(), None).await.unwrap_err();
        assert!(matches!(
            err,
            UndertowError::Torrent(TorrentError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_unknown_torrent() {
        let (service, _) = service(UndertowConfig::for_testing());
        let err = service
            .remove_torrent(InfoHash::new([0xee; 20]), false)
            .unwrap_err();
        assert!(matches!(err, TorrentError::TorrentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sessions() {
        let (service, engine_session) = service(UndertowConfig::for_testing());
        let session = service
            .add_torrent(Arc::new(MockEngine::with_pieces(16, MIB)))
            .unwrap();

        service.shutdown().await;

        assert!(session.is_closed());
        assert!(service.is_shutdown());
        assert!(service.sessions().is_empty());
        assert_eq!(engine_session.removed(), vec![(session.info_hash(), false)]);
        assert!(
            service
                .add_torrent(Arc::new(MockEngine::with_pieces(4, MIB)))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_metadata_wait_uses_configured_timeout() {
        let mut config = UndertowConfig::for_testing();
        config.metadata.resolve_timeout = Duration::from_millis(20);
        let (service, _) = service(config);
        let session = service
            .add_torrent(Arc::new(MockEngine::with_pieces(16, MIB).without_metadata()))
            .unwrap();

        let err = service.wait_for_metadata(session.info_hash()).await.unwrap_err();
        assert!(matches!(err, TorrentError::MetadataTimeout { .. }));
    }
}
