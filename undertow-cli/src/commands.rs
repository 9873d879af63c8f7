//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use undertow_core::config::StorageKind;
use undertow_core::engine::EngineFile;
use undertow_core::selection::candidates::append_size_suffixes;
use undertow_core::selection::{FileSelector, MediaHint, NoHistory, NoShowMetadata};
use undertow_core::streaming::{MetadataWait, TorrentSession, format_bytes};
use undertow_core::torrent::{FileTable, PieceLayout};
use undertow_core::{StreamingService, UndertowConfig};
use undertow_sim::{
    FixedMemoryProbe, SimEngineSession, SimTorrent, SimulatedEngine, SwarmConfig, spawn_driver,
};

use crate::prompt::TerminalPrompt;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const DRIVER_TICK: Duration = Duration::from_millis(100);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a torrent from a simulated swarm and report progress
    Simulate(SimulateArgs),
    /// Show which files of a torrent are playback candidates
    Candidates(CandidatesArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    Memory,
    File,
}

impl From<StorageArg> for StorageKind {
    fn from(value: StorageArg) -> Self {
        match value {
            StorageArg::Memory => StorageKind::Memory,
            StorageArg::File => StorageKind::File,
        }
    }
}

/// A torrent file given as `path=size_in_mib`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: String,
    pub size: u64,
}

fn parse_file_spec(value: &str) -> std::result::Result<FileSpec, String> {
    let (path, size) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected path=size_mib, got {value}"))?;
    if path.is_empty() {
        return Err(format!("empty path in {value}"));
    }
    let size: u64 = size
        .trim()
        .parse()
        .map_err(|_| format!("invalid size in {value}"))?;
    Ok(FileSpec {
        path: path.to_string(),
        size: size * MIB,
    })
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// JSON configuration file; environment overrides apply without one
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Seed of the simulated swarm
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// Seconds to run
    #[arg(long, default_value_t = 20)]
    pub duration: u64,
    /// Swarm download rate in KiB/s
    #[arg(long, default_value_t = 4096)]
    pub rate_kib: u64,
    /// Piece length in KiB
    #[arg(long, default_value_t = 1024)]
    pub piece_kib: u64,
    /// Storage backend, overriding the configuration
    #[arg(long, value_enum)]
    pub storage: Option<StorageArg>,
    /// Delay before the swarm delivers metadata
    #[arg(long, default_value_t = 0)]
    pub metadata_delay_ms: u64,
    /// Playback read rate in KiB/s once buffering finishes
    #[arg(long, default_value_t = 512)]
    pub playback_kib: u64,
    /// Torrent file as path=size_mib; repeatable
    #[arg(long = "file", value_parser = parse_file_spec)]
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Args)]
pub struct CandidatesArgs {
    /// JSON array of {"path", "size"} entries
    pub files: PathBuf,
    /// JSON media hint (season, episode, show_id, ...)
    #[arg(long)]
    pub hint: Option<PathBuf>,
    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Run the full choice, prompting on the terminal when ambiguous
    #[arg(long)]
    pub pick: bool,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    path: String,
    size: u64,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::Candidates(args) => candidates(args).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<UndertowConfig> {
    let Some(path) = path else {
        return Ok(UndertowConfig::from_env());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn file_selector(config: &UndertowConfig) -> FileSelector {
    FileSelector::new(
        config.selection.clone(),
        Arc::new(NoShowMetadata),
        Arc::new(TerminalPrompt),
        Arc::new(NoHistory),
    )
}

fn default_files() -> Vec<FileSpec> {
    vec![
        FileSpec {
            path: "Feature/sample.mkv".to_string(),
            size: 8 * MIB,
        },
        FileSpec {
            path: "Feature/feature.mkv".to_string(),
            size: 700 * MIB,
        },
        FileSpec {
            path: "Feature/feature.srt".to_string(),
            size: 64 * KIB,
        },
    ]
}

fn sim_torrent(piece_length: u64, files: &[FileSpec]) -> SimTorrent {
    let name = files
        .first()
        .and_then(|file| file.path.split('/').next())
        .unwrap_or("simulated")
        .to_string();
    files
        .iter()
        .fold(SimTorrent::new(name, piece_length), |torrent, file| {
            torrent.with_file(file.path.clone(), file.size)
        })
}

/// Streams the chosen file of a simulated torrent: buffers, then reads at
/// the playback rate while printing the session status every second.
///
/// # Errors
/// - Configuration cannot be loaded
/// - Metadata does not arrive or file selection fails
pub async fn simulate(args: SimulateArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(storage) = args.storage {
        config.storage.kind = storage.into();
    }
    if args.piece_kib == 0 {
        bail!("Piece length must be positive");
    }

    let files = if args.files.is_empty() {
        default_files()
    } else {
        args.files.clone()
    };
    let torrent = sim_torrent(args.piece_kib * KIB, &files);
    let swarm = SwarmConfig {
        seed: args.seed,
        bytes_per_second: args.rate_kib * KIB,
        metadata_delay: Duration::from_millis(args.metadata_delay_ms),
        ..SwarmConfig::default()
    };

    let mut engine = SimulatedEngine::new(torrent, swarm);
    if config.storage.is_memory() {
        engine = engine.with_memory_storage(config.storage.memory_size);
    }
    let engine = Arc::new(engine);

    let engine_session = Arc::new(SimEngineSession::new());
    engine_session.register(Arc::clone(&engine));
    let cancel = CancellationToken::new();
    let driver = spawn_driver(Arc::clone(&engine), DRIVER_TICK, cancel.clone());

    let selector = file_selector(&config);
    let service = StreamingService::new(
        config,
        engine_session,
        Arc::new(FixedMemoryProbe::new(8 * 1024 * MIB, 4 * 1024 * MIB)),
        selector,
    );

    let result = stream(&service, engine, &args).await;

    service.shutdown().await;
    cancel.cancel();
    driver.await.context("Simulation driver failed")?;
    result
}

async fn stream(
    service: &StreamingService,
    engine: Arc<SimulatedEngine>,
    args: &SimulateArgs,
) -> Result<()> {
    let session = service.add_torrent(engine)?;
    let info_hash = session.info_hash();
    println!("Simulating {} ({info_hash})", session.name());

    if service.wait_for_metadata(info_hash).await? == MetadataWait::Cancelled {
        bail!("Simulation cancelled before metadata arrived");
    }

    let selection = service.play(info_hash, None).await?;
    let file = selection.file;
    let piece_length = session.layout()?.pieces.piece_length;
    println!("Playing {} ({})", file.path, format_bytes(file.size));

    let playback_rate = args.playback_kib * KIB;
    let mut reader = None;
    let mut position = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    for second in 1..=args.duration {
        ticker.tick().await;

        if reader.is_none() && session.is_buffering_finished() {
            info!("Buffering finished after {second}s, starting playback");
            reader = Some(session.open_reader(&file, 0)?);
        }

        if let Some(reader) = &reader {
            let piece = ((file.offset + position) / piece_length) as u32;
            if session.has_piece(piece) {
                let len = playback_rate.min(file.size - position);
                reader.record_read(len);
                position += len;
            } else {
                reader.wait_for_piece(piece);
            }
        }

        print_status(second, &session, position);
        if position >= file.size {
            println!("Playback reached the end of {}", file.path);
            break;
        }
    }

    Ok(())
}

fn print_status(second: u64, session: &TorrentSession, position: u64) {
    let (down, up) = session.humanized_rates();
    let connections = session.connections();
    let buffer = if session.is_buffering() {
        format!(" buffer {:.0}%", session.buffer_progress())
    } else {
        String::new()
    };
    println!(
        "[{second:>4}s] {:<11} {:>5.1}%{buffer}  {down} / {up}  seeds {}/{} peers {}/{}  at {}",
        session.state_label(),
        session.real_progress(),
        connections.seeds,
        connections.seeds_total,
        connections.peers,
        connections.peers_total,
        format_bytes(position)
    );
}

/// Lists the playback candidates of a file list, optionally running the
/// full choice.
///
/// # Errors
/// - Input files cannot be read or parsed
/// - Selection fails or is cancelled
pub async fn candidates(args: CandidatesArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let entries: Vec<FileEntry> = load_json(&args.files)?;
    let hint = args
        .hint
        .as_deref()
        .map(load_json::<MediaHint>)
        .transpose()?;

    let files = file_table(&entries, MIB);
    let selector = file_selector(&config);
    let set = selector
        .select_candidates(files.as_slice(), hint.as_ref())
        .await?;

    let mut candidates = set.candidates.clone();
    if !hint.as_ref().is_some_and(MediaHint::is_episode) {
        append_size_suffixes(&mut candidates);
    }

    if candidates.is_empty() {
        println!("No candidates; the largest file is used");
    }
    for (position, candidate) in candidates.iter().enumerate() {
        println!(
            "{:>3}. {}  [{}]",
            position + 1,
            candidate.display_name,
            candidate.path
        );
    }
    if let Some(biggest) = files.by_index(set.biggest) {
        println!("Largest file: {} ({})", biggest.path, format_bytes(biggest.size));
    }

    if args.pick {
        let selection = selector.choose(files.as_slice(), hint.as_ref()).await?;
        println!("Chosen: {}", selection.file.path);
    }
    Ok(())
}

fn file_table(entries: &[FileEntry], piece_length: u64) -> FileTable {
    let mut offset = 0;
    let files: Vec<EngineFile> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let file = EngineFile::new(index, entry.path.clone(), entry.size, offset);
            offset += entry.size;
            file
        })
        .collect();

    let piece_count = offset.div_ceil(piece_length) as u32;
    FileTable::from_engine(&PieceLayout::new(piece_length, piece_count, offset), &files)
}
