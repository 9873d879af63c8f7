//! Session-wide operations over a set of simulated torrents.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::info;
use undertow_core::{EngineSession, InfoHash, TorrentEngine, TorrentError};

use crate::engine::SimulatedEngine;

#[derive(Default)]
pub struct SimEngineSession {
    engines: RwLock<HashMap<InfoHash, Arc<SimulatedEngine>>>,
    limited: AtomicBool,
    paused: AtomicBool,
}

impl SimEngineSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: Arc<SimulatedEngine>) {
        let info_hash = engine.info_hash();
        self.engines.write().insert(info_hash, engine);
    }

    pub fn engines(&self) -> Vec<Arc<SimulatedEngine>> {
        self.engines.read().values().cloned().collect()
    }

    /// True while buffering limits are in force.
    pub fn is_limited(&self) -> bool {
        self.limited.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

impl EngineSession for SimEngineSession {
    fn apply_buffering_limits(&self) {
        info!("Applying buffering limits to simulated session");
        self.limited.store(true, Ordering::Release);
    }

    fn restore_limits(&self) {
        info!("Restoring simulated session limits");
        self.limited.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn remove_torrent(&self, info_hash: InfoHash, remove_files: bool) -> Result<(), TorrentError> {
        let engine = self
            .engines
            .write()
            .remove(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;
        engine.invalidate();
        info!("Removed simulated torrent {info_hash} (remove_files={remove_files})");
        Ok(())
    }
}
