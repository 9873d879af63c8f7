//! Simulated torrent engine.
//!
//! Downloads pieces in the order a real engine would pick them: pieces with
//! a deadline first (earliest deadline wins), then by descending priority,
//! then by index. Pieces at `Skip` without a deadline are never requested.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};
use undertow_core::engine::{
    EngineMetadata, MemoryStorage, PartialPiece, PieceSnapshot, SwarmStatus, TorrentEngine,
};
use undertow_core::torrent::{Bitfield, PieceLayout, TorrentState};
use undertow_core::{InfoHash, PiecePriority, TorrentError};

use crate::storage::SimMemoryStorage;
use crate::swarm::{SimTorrent, SwarmConfig};

/// What one call to [`SimulatedEngine::advance`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub bytes: u64,
    pub completed: Vec<u32>,
    pub evicted: Vec<u32>,
}

struct SwarmState {
    rng: ChaCha8Rng,
    elapsed: Duration,
    priorities: Vec<PiecePriority>,
    deadlines: BTreeMap<u32, u32>,
    downloaded: Vec<u64>,
    completed: Vec<bool>,
    paused: bool,
    download_rate: u64,
    reannounces: u32,
}

/// A torrent whose pieces arrive from a deterministic simulated swarm.
pub struct SimulatedEngine {
    torrent: SimTorrent,
    swarm: SwarmConfig,
    info_hash: InfoHash,
    layout: PieceLayout,
    valid: AtomicBool,
    memory: Option<Arc<SimMemoryStorage>>,
    state: Mutex<SwarmState>,
}

impl SimulatedEngine {
    pub fn new(torrent: SimTorrent, swarm: SwarmConfig) -> Self {
        let piece_count = torrent.piece_count();
        let pieces = piece_count as usize;
        let state = SwarmState {
            rng: ChaCha8Rng::seed_from_u64(swarm.seed),
            elapsed: Duration::ZERO,
            priorities: vec![PiecePriority::Skip; pieces],
            deadlines: BTreeMap::new(),
            downloaded: vec![0; pieces],
            completed: vec![false; pieces],
            paused: false,
            download_rate: 0,
            reannounces: 0,
        };

        Self {
            info_hash: torrent.info_hash(swarm.seed),
            layout: PieceLayout::new(torrent.piece_length, piece_count, torrent.total_size()),
            torrent,
            swarm,
            valid: AtomicBool::new(true),
            memory: None,
            state: Mutex::new(state),
        }
    }

    /// Backs the torrent with a bounded memory window of `memory_size` bytes.
    pub fn with_memory_storage(mut self, memory_size: u64) -> Self {
        self.memory = Some(Arc::new(SimMemoryStorage::new(
            memory_size,
            self.torrent.piece_length,
        )));
        self
    }

    pub fn memory(&self) -> Option<Arc<SimMemoryStorage>> {
        self.memory.clone()
    }

    /// Drops the engine handle, as the engine does after removal.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn priorities(&self) -> Vec<PiecePriority> {
        self.state.lock().priorities.clone()
    }

    pub fn deadline(&self, piece: u32) -> Option<u32> {
        self.state.lock().deadlines.get(&piece).copied()
    }

    pub fn reannounces(&self) -> u32 {
        self.state.lock().reannounces
    }

    pub fn completed_count(&self) -> u32 {
        self.state.lock().completed.iter().filter(|done| **done).count() as u32
    }

    fn metadata_visible(&self, state: &SwarmState) -> bool {
        state.elapsed >= self.swarm.metadata_delay
    }

    /// Moves simulated time forward by `elapsed` and downloads whatever the
    /// swarm delivers in that time.
    pub fn advance(&self, elapsed: Duration) -> TickReport {
        let mut state = self.state.lock();
        state.elapsed += elapsed;

        if state.paused || !self.is_valid() || !self.metadata_visible(&state) {
            state.download_rate = 0;
            return TickReport::default();
        }

        let jitter = self.swarm.jitter_percent.min(100);
        let scale = if jitter == 0 {
            100
        } else {
            state.rng.random_range(100 - jitter..=100 + jitter)
        };
        let mut budget = (u128::from(self.swarm.bytes_per_second)
            * elapsed.as_millis()
            * u128::from(scale)
            / 100_000) as u64;

        let mut report = TickReport::default();
        for piece in self.download_order(&state) {
            if budget == 0 {
                break;
            }
            let index = piece as usize;
            let size = self.torrent.piece_size(piece);
            let take = size.saturating_sub(state.downloaded[index]).min(budget);

            state.downloaded[index] += take;
            budget -= take;
            report.bytes += take;

            if state.downloaded[index] >= size {
                state.completed[index] = true;
                state.deadlines.remove(&piece);
                report.completed.push(piece);
            }
        }

        let millis = elapsed.as_millis().max(1) as u64;
        state.download_rate = report.bytes * 1000 / millis;

        if let Some(memory) = &self.memory {
            report.evicted = memory.admit(&report.completed);
            report.evicted.extend(memory.enforce_capacity());
            for piece in &report.evicted {
                state.completed[*piece as usize] = false;
                state.downloaded[*piece as usize] = 0;
            }
        }

        if !report.completed.is_empty() {
            trace!(
                "Simulated tick completed pieces {:?}, evicted {:?}",
                report.completed, report.evicted
            );
        }
        report
    }

    fn download_order(&self, state: &SwarmState) -> Vec<u32> {
        let mut wanted: Vec<u32> = (0..self.layout.piece_count)
            .filter(|piece| {
                let index = *piece as usize;
                !state.completed[index]
                    && (state.priorities[index] > PiecePriority::Skip
                        || state.deadlines.contains_key(piece))
            })
            .collect();

        wanted.sort_by_key(|piece| {
            (
                state.deadlines.get(piece).copied().unwrap_or(u32::MAX),
                Reverse(state.priorities[*piece as usize]),
                *piece,
            )
        });
        wanted.truncate(self.swarm.max_in_flight.max(1));
        wanted
    }

    fn progress(&self, state: &SwarmState) -> f64 {
        let (wanted, downloaded) = state
            .priorities
            .iter()
            .enumerate()
            .filter(|(_, priority)| **priority > PiecePriority::Skip)
            .fold((0u64, 0u64), |(wanted, downloaded), (index, _)| {
                (
                    wanted + self.torrent.piece_size(index as u32),
                    downloaded + state.downloaded[index],
                )
            });

        if wanted == 0 {
            return 0.0;
        }
        downloaded as f64 / wanted as f64
    }

    fn torrent_state(&self, state: &SwarmState) -> TorrentState {
        if !self.metadata_visible(state) {
            TorrentState::Finding
        } else if state.completed.iter().all(|done| *done) {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        }
    }
}

impl TorrentEngine for SimulatedEngine {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn metadata(&self) -> Option<EngineMetadata> {
        let state = self.state.lock();
        self.metadata_visible(&state)
            .then(|| self.torrent.metadata())
    }

    fn set_piece_priority(&self, piece: u32, priority: PiecePriority) {
        if let Some(slot) = self.state.lock().priorities.get_mut(piece as usize) {
            *slot = priority;
        }
    }

    fn set_piece_deadline(&self, piece: u32, deadline_ms: u32) {
        if piece < self.layout.piece_count {
            self.state.lock().deadlines.insert(piece, deadline_ms);
        }
    }

    fn clear_piece_deadlines(&self) {
        self.state.lock().deadlines.clear();
    }

    fn prioritize_pieces(&self, priorities: &[PiecePriority]) {
        let mut state = self.state.lock();
        for (slot, priority) in state.priorities.iter_mut().zip(priorities) {
            *slot = *priority;
        }
    }

    fn set_file_priority(&self, file_index: usize, priority: PiecePriority) {
        let Some((_, size)) = self.torrent.files.get(file_index) else {
            return;
        };
        let offset: u64 = self.torrent.files[..file_index]
            .iter()
            .map(|(_, size)| size)
            .sum();
        let range = self.layout.byte_region_pieces(offset, *size);
        if range.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        for piece in range.iter() {
            if let Some(slot) = state.priorities.get_mut(piece as usize) {
                *slot = priority;
            }
        }
    }

    fn piece_bitfield(&self) -> Result<PieceSnapshot, TorrentError> {
        let state = self.state.lock();
        let bits = Bitfield::from_flags(&state.completed);
        Ok(PieceSnapshot {
            state: self.torrent_state(&state) as u8,
            bits: bits.as_bytes().to_vec(),
            len: bits.len(),
        })
    }

    fn download_queue(&self) -> Vec<PartialPiece> {
        let state = self.state.lock();
        state
            .downloaded
            .iter()
            .enumerate()
            .filter(|(index, bytes)| **bytes > 0 && !state.completed[*index])
            .map(|(index, bytes)| PartialPiece {
                index: index as u32,
                bytes_downloaded: *bytes,
                bytes_total: self.torrent.piece_size(index as u32),
            })
            .collect()
    }

    fn status(&self) -> Result<SwarmStatus, TorrentError> {
        if !self.is_valid() {
            return Err(TorrentError::Engine {
                reason: format!("torrent {} was removed", self.info_hash),
            });
        }

        let state = self.state.lock();
        let seeding = self.torrent_state(&state) == TorrentState::Seeding;
        Ok(SwarmStatus {
            state: self.torrent_state(&state),
            progress: if seeding { 1.0 } else { self.progress(&state) },
            paused: state.paused,
            download_rate: state.download_rate,
            upload_rate: state.download_rate / 10,
            connected_seeds: self.swarm.seeds.min(self.swarm.max_in_flight as u32),
            connected_peers: self.swarm.peers.min(self.swarm.max_in_flight as u32 * 2),
            scrape_complete: Some(self.swarm.seeds),
            scrape_incomplete: Some(self.swarm.peers),
            list_seeds: self.swarm.seeds,
            list_peers: self.swarm.peers,
        })
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn resume(&self) {
        self.state.lock().paused = false;
    }

    fn force_reannounce(&self) {
        debug!("Simulated tracker re-announce for {}", self.info_hash);
        self.state.lock().reannounces += 1;
    }

    fn force_dht_announce(&self) {
        debug!("Simulated DHT announce for {}", self.info_hash);
        self.state.lock().reannounces += 1;
    }

    fn memory_storage(&self) -> Option<Arc<dyn MemoryStorage>> {
        self.memory
            .clone()
            .map(|memory| memory as Arc<dyn MemoryStorage>)
    }
}
