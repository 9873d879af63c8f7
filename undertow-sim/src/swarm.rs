//! Swarm and torrent shape of a simulation run.

use std::time::Duration;

use sha1::{Digest, Sha1};
use undertow_core::InfoHash;
use undertow_core::engine::{EngineFile, EngineMetadata};

const MIB: u64 = 1024 * 1024;

/// Behaviour of the simulated peers.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Seed for the deterministic RNG
    pub seed: u64,
    pub seeds: u32,
    pub peers: u32,
    /// Aggregate download rate of the swarm in bytes per second
    pub bytes_per_second: u64,
    /// Per-tick rate variation in percent, applied symmetrically
    pub jitter_percent: u32,
    /// Simulated time before the metadata exchange completes
    pub metadata_delay: Duration,
    /// Pieces requested concurrently
    pub max_in_flight: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            seeds: 12,
            peers: 30,
            bytes_per_second: 4 * MIB,
            jitter_percent: 20,
            metadata_delay: Duration::ZERO,
            max_in_flight: 8,
        }
    }
}

/// Files and piece size of a simulated torrent.
#[derive(Debug, Clone)]
pub struct SimTorrent {
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<(String, u64)>,
}

impl SimTorrent {
    pub fn new(name: impl Into<String>, piece_length: u64) -> Self {
        Self {
            name: name.into(),
            piece_length,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, size: u64) -> Self {
        self.files.push((path.into(), size));
        self
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|(_, size)| size).sum()
    }

    pub fn piece_count(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_size().div_ceil(self.piece_length) as u32
    }

    /// Derives a stable info hash from the torrent name and the swarm seed.
    pub fn info_hash(&self, seed: u64) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(seed.to_be_bytes());
        InfoHash::new(hasher.finalize().into())
    }

    pub fn metadata(&self) -> EngineMetadata {
        let mut offset = 0;
        let files = self
            .files
            .iter()
            .enumerate()
            .map(|(index, (path, size))| {
                let file = EngineFile::new(index, path.clone(), *size, offset);
                offset += size;
                file
            })
            .collect();

        EngineMetadata {
            name: self.name.clone(),
            piece_length: self.piece_length,
            piece_count: self.piece_count(),
            total_size: self.total_size(),
            files,
        }
    }

    /// Byte length of `piece`; the last piece may be short.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = u64::from(piece) * self.piece_length;
        self.total_size()
            .saturating_sub(start)
            .min(self.piece_length)
    }
}
