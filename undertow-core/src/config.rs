//! Centralized configuration for Undertow.
//!
//! All tunable buffering, scheduling and selection parameters live here so
//! the streaming components never carry hard-coded sizes of their own.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UndertowConfig {
    pub streaming: StreamingConfig,
    pub storage: StorageConfig,
    pub selection: SelectionConfig,
    pub metadata: MetadataConfig,
}

/// Buffering and piece scheduling configuration.
///
/// Controls the size of the startup windows, the cadence of the watch loop
/// timers and the readahead granted to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bytes that must be downloaded from the start of a file before playback
    pub buffer_size: u64,
    /// Bytes that must be downloaded from the end of a file before playback
    pub end_buffer_size: u64,
    /// Grow memory storage toward 25 pieces when free memory allows it
    pub auto_adjust_memory_size: bool,
    /// Pause and resume the torrent on startup to force piece re-evaluation
    pub use_pause_resume: bool,
    /// Skip DHT re-announce when buffering starts
    pub disable_dht: bool,
    /// Readahead budget used when storage is not memory-backed
    pub default_readahead: u64,
    /// A reader without reads for this long is classified as idle
    #[serde(with = "duration_millis")]
    pub reader_idle_after: Duration,
    /// Interval of the buffer progress tick
    #[serde(with = "duration_millis")]
    pub buffer_tick: Duration,
    /// Interval of the piece reconciliation tick
    #[serde(with = "duration_millis")]
    pub prioritize_tick: Duration,
    /// Delay before a finished trailing episode releases its session
    #[serde(with = "duration_millis")]
    pub trailing_episode_delay: Duration,
    /// Minimum age of the cached completion bitfield before it is refreshed
    #[serde(with = "duration_millis")]
    pub pieces_refresh_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20 * MIB,
            end_buffer_size: 4 * MIB,
            auto_adjust_memory_size: true,
            use_pause_resume: false,
            disable_dht: false,
            default_readahead: 50 * MIB,
            reader_idle_after: Duration::from_secs(5),
            buffer_tick: Duration::from_secs(1),
            prioritize_tick: Duration::from_secs(1),
            trailing_episode_delay: Duration::from_secs(15 * 60),
            pieces_refresh_interval: Duration::from_millis(500),
        }
    }
}

/// Which storage backend the engine session was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Pieces live in a bounded in-memory window and may be evicted
    Memory,
    /// Pieces are written to disk and never evicted
    File,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend of the engine session
    pub kind: StorageKind,
    /// Initial memory window for memory-backed sessions
    pub memory_size: u64,
    /// Directory holding `.torrent` and `.fastresume` files
    pub torrents_path: PathBuf,
    /// Directory holding downloaded content and `.parts` files
    pub download_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            memory_size: 100 * MIB,
            torrents_path: PathBuf::from("torrents"),
            download_path: PathBuf::from("downloads"),
        }
    }
}

impl StorageConfig {
    /// Returns true when the engine keeps pieces in memory only.
    pub fn is_memory(&self) -> bool {
        self.kind == StorageKind::Memory
    }
}

/// Candidate file selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Files smaller than this are never playback candidates
    pub min_candidate_size: u64,
    /// Per-minute size used to derive the threshold for episodes
    pub min_candidate_show_size: u64,
    /// Archives above this size require confirmation
    pub archive_size_threshold: u64,
    /// Runtime assumed when the show reports none shorter, in minutes
    pub default_episode_runtime: u32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_candidate_size: 100 * MIB,
            min_candidate_show_size: 2 * MIB,
            archive_size_threshold: 10 * MIB,
            default_episode_runtime: 30,
        }
    }
}

/// Metadata resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Upper bound on waiting for a magnet link to resolve
    #[serde(with = "duration_millis")]
    pub resolve_timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(60),
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(bytes) = env_parse::<u64>("UNDERTOW_BUFFER_SIZE") {
            config.streaming.buffer_size = bytes;
        }

        if let Some(bytes) = env_parse::<u64>("UNDERTOW_END_BUFFER_SIZE") {
            config.streaming.end_buffer_size = bytes;
        }

        if let Some(enabled) = env_parse::<bool>("UNDERTOW_AUTO_ADJUST_MEMORY") {
            config.streaming.auto_adjust_memory_size = enabled;
        }

        if let Some(disabled) = env_parse::<bool>("UNDERTOW_DISABLE_DHT") {
            config.streaming.disable_dht = disabled;
        }

        if let Ok(kind) = std::env::var("UNDERTOW_STORAGE") {
            match kind.to_lowercase().as_str() {
                "memory" => config.storage.kind = StorageKind::Memory,
                "file" => config.storage.kind = StorageKind::File,
                _ => {}
            }
        }

        if let Some(bytes) = env_parse::<u64>("UNDERTOW_MEMORY_SIZE") {
            config.storage.memory_size = bytes;
        }

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_MAGNET_TIMEOUT") {
            config.metadata.resolve_timeout = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Small windows and short timers keep tests fast; memory auto-growth is
    /// disabled so sizes stay predictable.
    pub fn for_testing() -> Self {
        Self {
            streaming: StreamingConfig {
                buffer_size: 4 * MIB,
                end_buffer_size: MIB,
                auto_adjust_memory_size: false,
                default_readahead: 8 * MIB,
                pieces_refresh_interval: Duration::ZERO,
                ..Default::default()
            },
            storage: StorageConfig {
                memory_size: 16 * MIB,
                ..Default::default()
            },
            selection: SelectionConfig {
                min_candidate_size: 10 * MIB,
                ..Default::default()
            },
            metadata: MetadataConfig {
                resolve_timeout: Duration::from_secs(2),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
