//! One streaming torrent: buffering, reconciliation and reader bookkeeping.
//!
//! A [`TorrentSession`] is owned by the
//! [`StreamingService`](crate::service::StreamingService) and driven by its
//! watch loop. Every handler re-checks the cancellation token before touching
//! the engine, so nothing is mutated once the session is closed.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{BufferPhase, BufferState, BufferWindows, update_piece_progress};
use super::memory::{self, MemoryProbe};
use super::readers::{ReaderId, ReaderInfo, ReaderRegistry};
use super::scheduler::{Fingerprint, PlanInputs, PriorityPlan};
use super::watch::WatchCommand;
use super::{format_bytes, format_bytes_per_second};
use crate::config::{StorageConfig, StreamingConfig, UndertowConfig};
use crate::engine::{EngineSession, MemoryStorage, PiecePriority, TorrentEngine};
use crate::selection::episodes;
use crate::torrent::{
    CompletionView, FileTable, InfoHash, PieceLayout, PieceRange, PieceSet, TorrentError,
    TorrentFile, TorrentState,
};

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<dyn TorrentEngine>,
    pub engine_session: Arc<dyn EngineSession>,
    pub memory_probe: Arc<dyn MemoryProbe>,
    pub config: Arc<UndertowConfig>,
    /// Cancelled when the owning service shuts down
    pub parent: CancellationToken,
}

/// Outcome of waiting for metadata that did not time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataWait {
    Received,
    Cancelled,
}

/// User-facing state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Queued,
    Checking,
    Finding,
    Downloading,
    Finished,
    Seeding,
    Paused,
    Buffering,
    Playing,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Queued => "Queued",
            SessionStatus::Checking => "Checking",
            SessionStatus::Finding => "Finding",
            SessionStatus::Downloading => "Downloading",
            SessionStatus::Finished => "Finished",
            SessionStatus::Seeding => "Seeding",
            SessionStatus::Paused => "Paused",
            SessionStatus::Buffering => "Buffering",
            SessionStatus::Playing => "Playing",
        }
    }
}

impl From<TorrentState> for SessionStatus {
    fn from(state: TorrentState) -> Self {
        match state {
            TorrentState::Queued => SessionStatus::Queued,
            TorrentState::Checking => SessionStatus::Checking,
            TorrentState::Finding => SessionStatus::Finding,
            TorrentState::Downloading => SessionStatus::Downloading,
            TorrentState::Finished => SessionStatus::Finished,
            TorrentState::Seeding => SessionStatus::Seeding,
        }
    }
}

/// Connected and swarm-wide peer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Connections {
    pub seeds: u32,
    pub seeds_total: u32,
    pub peers: u32,
    pub peers_total: u32,
}

/// Playback position reported by the player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackPosition {
    pub watched: Duration,
    pub duration: Duration,
}

/// Files persisted for a torrent outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub torrent_file: PathBuf,
    pub fast_resume: PathBuf,
    pub parts: PathBuf,
}

impl ArtifactPaths {
    fn new(info_hash: InfoHash, storage: &StorageConfig) -> Self {
        Self {
            torrent_file: storage.torrents_path.join(format!("{info_hash}.torrent")),
            fast_resume: storage.torrents_path.join(format!("{info_hash}.fastresume")),
            parts: storage.download_path.join(format!(".{info_hash}.parts")),
        }
    }
}

/// Metadata-derived state, set once.
#[derive(Debug)]
pub struct SessionLayout {
    pub name: String,
    pub pieces: PieceLayout,
    pub files: FileTable,
    awaiting: PieceSet,
    demand: PieceSet,
}

impl SessionLayout {
    /// Pieces readers are blocked on.
    pub fn awaiting(&self) -> &PieceSet {
        &self.awaiting
    }

    /// Pieces still demanded by a re-buffer.
    pub fn demand(&self) -> &PieceSet {
        &self.demand
    }
}

/// Streaming state of one torrent.
pub struct TorrentSession {
    info_hash: InfoHash,
    engine: Arc<dyn TorrentEngine>,
    engine_session: Arc<dyn EngineSession>,
    memory_probe: Arc<dyn MemoryProbe>,
    streaming: StreamingConfig,
    storage: StorageConfig,
    cancel: CancellationToken,
    added_time: DateTime<Utc>,
    artifacts: ArtifactPaths,

    layout: OnceLock<SessionLayout>,
    metadata_ready: watch::Sender<bool>,
    completion: CompletionView,
    readers: ReaderRegistry,
    buffer: RwLock<BufferState>,
    chosen: Mutex<BTreeSet<usize>>,
    reserved: Mutex<Vec<u32>>,

    memory_size: AtomicU64,
    memory_storage: Mutex<Option<Arc<dyn MemoryStorage>>>,
    last_fingerprint: Mutex<Option<Fingerprint>>,
    piece_status: Mutex<String>,
    last_progress: Mutex<f64>,

    reconcile_guard: Mutex<()>,
    buffer_tick_guard: Mutex<()>,

    playing: AtomicBool,
    next_file: AtomicBool,
    seeding: AtomicBool,
    paused: AtomicBool,

    commands: mpsc::UnboundedSender<WatchCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchCommand>>>,
}

impl TorrentSession {
    /// Creates a session for the engine's torrent. If the engine already has
    /// metadata the file table is built immediately.
    pub fn new(context: SessionContext) -> Arc<Self> {
        let SessionContext {
            engine,
            engine_session,
            memory_probe,
            config,
            parent,
        } = context;

        let info_hash = engine.info_hash();
        let cancel = parent.child_token();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (metadata_ready, _) = watch::channel(false);

        let session = Arc::new(Self {
            info_hash,
            completion: CompletionView::new(
                Arc::clone(&engine),
                cancel.clone(),
                config.streaming.pieces_refresh_interval,
            ),
            readers: ReaderRegistry::new(config.streaming.reader_idle_after),
            engine,
            engine_session,
            memory_probe,
            streaming: config.streaming.clone(),
            storage: config.storage.clone(),
            cancel,
            added_time: Utc::now(),
            artifacts: ArtifactPaths::new(info_hash, &config.storage),
            layout: OnceLock::new(),
            metadata_ready,
            buffer: RwLock::new(BufferState::default()),
            chosen: Mutex::new(BTreeSet::new()),
            reserved: Mutex::new(Vec::new()),
            memory_size: AtomicU64::new(config.storage.memory_size),
            memory_storage: Mutex::new(None),
            last_fingerprint: Mutex::new(None),
            piece_status: Mutex::new(String::new()),
            last_progress: Mutex::new(0.0),
            reconcile_guard: Mutex::new(()),
            buffer_tick_guard: Mutex::new(()),
            playing: AtomicBool::new(false),
            next_file: AtomicBool::new(false),
            seeding: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
        });

        if session.engine.has_metadata() {
            if let Err(e) = session.on_metadata_received() {
                warn!("Could not load metadata for {}: {e}", session.info_hash);
            }
        }

        session
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.streaming
    }

    pub fn is_memory_storage(&self) -> bool {
        self.storage.is_memory()
    }

    pub fn artifacts(&self) -> &ArtifactPaths {
        &self.artifacts
    }

    pub fn added_time(&self) -> DateTime<Utc> {
        self.added_time
    }

    /// Command receiver of the watch loop; handed out once.
    pub(crate) fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<WatchCommand>> {
        self.command_rx.lock().take()
    }

    pub(crate) fn send_command(&self, command: WatchCommand) {
        if self.commands.send(command).is_err() {
            debug!("Watch loop of {} is gone", self.info_hash);
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sets the teardown signal. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// The engine, unless the session is closed.
    fn live_engine(&self) -> Option<&dyn TorrentEngine> {
        (!self.is_closed()).then(|| self.engine.as_ref())
    }

    /// Metadata-derived state.
    ///
    /// # Errors
    ///
    /// - `TorrentError::NotReady` - Metadata has not been received yet
    pub fn layout(&self) -> Result<&SessionLayout, TorrentError> {
        self.layout.get().ok_or(TorrentError::NotReady {
            info_hash: self.info_hash,
        })
    }

    pub fn has_metadata(&self) -> bool {
        self.layout.get().is_some()
    }

    /// Builds the file table and piece sets from the engine's metadata.
    /// Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// - `TorrentError::NotReady` - The engine has not resolved metadata
    pub fn on_metadata_received(&self) -> Result<(), TorrentError> {
        if self.layout.get().is_some() {
            return Ok(());
        }

        let metadata = self.engine.metadata().ok_or(TorrentError::NotReady {
            info_hash: self.info_hash,
        })?;

        let pieces = PieceLayout::new(
            metadata.piece_length,
            metadata.piece_count,
            metadata.total_size,
        );
        let files = FileTable::from_engine(&pieces, &metadata.files);

        info!(
            "Metadata received for {}: {} files, {} pieces of {}",
            self.info_hash,
            files.len(),
            pieces.piece_count,
            format_bytes(pieces.piece_length)
        );

        let layout = SessionLayout {
            name: metadata.name,
            pieces,
            files,
            awaiting: PieceSet::new(pieces.piece_count),
            demand: PieceSet::new(pieces.piece_count),
        };
        if self.layout.set(layout).is_err() {
            return Ok(());
        }

        if self.storage.is_memory() {
            *self.memory_storage.lock() = self.engine.memory_storage();
        }
        self.metadata_ready.send_replace(true);
        Ok(())
    }

    /// Waits until metadata is received, the session closes, or `timeout`
    /// passes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataTimeout` - Metadata did not arrive in time
    pub async fn wait_for_metadata(&self, timeout: Duration) -> Result<MetadataWait, TorrentError> {
        let mut ready = self.metadata_ready.subscribe();
        info!("Waiting for information fetched for torrent: {}", self.info_hash);

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                warn!("Cancelling wait for metadata of {}: session closing", self.info_hash);
                Ok(MetadataWait::Cancelled)
            }
            received = ready.wait_for(|ready| *ready) => {
                if received.is_ok() {
                    info!("Information fetched for torrent: {}", self.info_hash);
                    Ok(MetadataWait::Received)
                } else {
                    Ok(MetadataWait::Cancelled)
                }
            }
            _ = tokio::time::sleep(timeout) => {
                error!("Expired timeout for resolving metadata of {}", self.info_hash);
                Err(TorrentError::MetadataTimeout {
                    info_hash: self.info_hash,
                    timeout,
                })
            }
        }
    }

    pub fn name(&self) -> String {
        self.layout
            .get()
            .map(|layout| layout.name.clone())
            .unwrap_or_else(|| self.info_hash.to_string())
    }

    /// Total content size, zero without metadata.
    pub fn length(&self) -> u64 {
        self.layout
            .get()
            .map_or(0, |layout| layout.pieces.total_size)
    }

    // Playback flags

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn set_seeding(&self, seeding: bool) {
        self.seeding.store(seeding, Ordering::SeqCst);
    }

    pub fn is_seeding(&self) -> bool {
        self.seeding.load(Ordering::SeqCst)
    }

    /// True while this session only prefetches the next episode.
    pub fn is_next_file(&self) -> bool {
        self.next_file.load(Ordering::SeqCst)
    }

    /// Marks the session as prefetching a trailing episode and arms the
    /// release timer. Outstanding buffer demand is dropped.
    pub fn start_next_timer(&self) {
        self.next_file.store(true, Ordering::SeqCst);
        self.send_command(WatchCommand::ArmTrailingTimer(
            self.streaming.trailing_episode_delay,
        ));
        if let Some(layout) = self.layout.get() {
            layout.demand.clear();
        }
    }

    pub fn stop_next_timer(&self) {
        self.next_file.store(false, Ordering::SeqCst);
        self.send_command(WatchCommand::DisarmTrailingTimer);
    }

    // Memory window

    pub fn memory_size(&self) -> u64 {
        self.memory_size.load(Ordering::SeqCst)
    }

    /// Resizes the engine's memory window. No-op without memory storage or
    /// once closed.
    pub fn adjust_memory_size(&self, bytes: u64) {
        if self.is_closed() {
            return;
        }
        let Some(storage) = self.memory_storage.lock().clone() else {
            return;
        };

        self.memory_size.store(bytes, Ordering::SeqCst);
        info!("Adjusting memory size to {}!", format_bytes(bytes));
        storage.set_memory_size(bytes);
    }

    /// Pins pieces in memory storage regardless of reader position.
    pub fn set_reserved_pieces(&self, pieces: Vec<u32>) {
        *self.reserved.lock() = pieces;
    }

    /// Readahead budget shared by all readers.
    ///
    /// Memory-backed sessions get the memory window minus reserved pieces and
    /// two spare pieces; others get the configured default.
    pub fn readahead_size(&self) -> u64 {
        if !self.storage.is_memory() {
            return self.streaming.default_readahead;
        }

        let piece_length = self
            .layout
            .get()
            .map_or(0, |layout| layout.pieces.piece_length);
        let reserved = self.reserved.lock().len() as u64;
        self.memory_size()
            .saturating_sub((reserved + 2) * piece_length)
    }

    // Buffering

    /// Starts buffering `file`.
    ///
    /// `startup` pushes a one-shot priority vector; otherwise only the window
    /// pieces are raised and given zero deadlines. A missing file finishes
    /// buffering immediately.
    pub fn buffer(&self, file: Option<&TorrentFile>, startup: bool) {
        let Some(file) = file else {
            self.buffer_finished();
            return;
        };
        if self.is_closed() {
            return;
        }
        let layout = match self.layout() {
            Ok(layout) => layout,
            Err(e) => {
                warn!("Cannot buffer {}: {e}", file.path);
                return;
            }
        };

        let piece_length = layout.pieces.piece_length;
        let memory = self.storage.is_memory();

        if memory && startup {
            let mut storage = self.memory_storage.lock();
            if storage.is_none() {
                *storage = self.engine.memory_storage();
            }
        }
        if memory && startup {
            if let Some(size) = memory::startup_floor(self.memory_size(), piece_length) {
                self.adjust_memory_size(size);
            }
        }

        self.send_command(WatchCommand::RestartBufferTicker);

        let windows = BufferWindows::for_file(
            &layout.pieces,
            file,
            self.streaming.buffer_size,
            self.streaming.end_buffer_size,
        );

        if memory {
            if self.streaming.auto_adjust_memory_size {
                let stats = self.memory_probe.memory_stats();
                if let Some(size) =
                    memory::growth_target(self.memory_size(), piece_length, stats.free)
                {
                    self.adjust_memory_size(size);
                }
            }

            if let Some(size) =
                memory::fit_buffer(self.memory_size(), windows.total_bytes(), piece_length)
            {
                info!(
                    "Adjusting memory size to {}, to fit all buffer!",
                    format_bytes(size)
                );
                self.adjust_memory_size(size);
            }
        }

        let Some(engine) = self.live_engine() else {
            return;
        };
        self.buffer.write().begin(&windows, piece_length);

        info!(
            "Setting buffer for file: {} ({} / {}). Pieces: {}-{} + {}-{}, PieceLength: {}, Pre: {}, Post: {}",
            file.path,
            format_bytes(file.size),
            format_bytes(layout.pieces.total_size),
            windows.pre.pieces.begin,
            windows.pre.pieces.end,
            windows.post.pieces.begin,
            windows.post.pieces.end,
            format_bytes(piece_length),
            format_bytes(windows.pre.size),
            format_bytes(windows.post.size)
        );

        self.engine_session.apply_buffering_limits();
        if self.is_closed() {
            self.engine_session.restore_limits();
            return;
        }

        if startup {
            let default = if memory {
                PiecePriority::Skip
            } else {
                PiecePriority::Background
            };
            engine.prioritize_pieces(&windows.startup_vector(layout.pieces.piece_count, default));
        } else {
            for piece in windows.pieces() {
                layout.demand.insert(piece);
                engine.set_piece_priority(piece, PiecePriority::Demand);
            }
            for piece in windows.pieces() {
                engine.set_piece_deadline(piece, 0);
            }
        }
        // The engine no longer holds the last reconciled plan.
        *self.last_fingerprint.lock() = None;

        if self.streaming.use_pause_resume && startup {
            self.pause();
            self.resume();
        }

        engine.force_reannounce();
        if !self.streaming.disable_dht {
            engine.force_dht_announce();
        }

        // Disk storage enables many pieces at once; window pieces go first.
        if !memory && startup {
            for piece in windows.pieces() {
                engine.set_piece_deadline(piece, 0);
            }
        }
    }

    /// Buffer progress tick: folds completion into the progress and signals
    /// the watch loop once 100% is reached.
    pub fn buffer_tick(&self) {
        if self.is_closed() {
            return;
        }
        let Some(_running) = self.buffer_tick_guard.try_lock() else {
            return;
        };
        let Ok(layout) = self.layout() else {
            return;
        };

        {
            let state = self.buffer.read();
            if !state.is_buffering() || !state.has_pieces() {
                return;
            }
        }

        let queue = self.engine.download_queue();
        let (tick, pieces_status) = {
            let mut state = self.buffer.write();
            let completed = update_piece_progress(
                state.pieces_mut(),
                |piece| self.completion.has_piece(piece),
                &queue,
            );
            for piece in completed {
                layout.awaiting.remove(piece);
                layout.demand.remove(piece);
            }
            (state.observe(), state.pieces_status())
        };

        let connections = self.connections();
        let (down, up) = self.humanized_rates();
        info!(
            "Buffer. Pr: {}%, Sp: {} / {}, Con: {}/{} + {}/{}, Pi: {}",
            tick.progress as u32,
            down,
            up,
            connections.seeds,
            connections.seeds_total,
            connections.peers,
            connections.peers_total,
            pieces_status
        );

        if tick.reached_full {
            self.send_command(WatchCommand::BufferFinished);
        }
    }

    /// Ends buffering and releases the session-wide buffering limits.
    pub fn buffer_finished(&self) {
        if self.is_closed() {
            return;
        }

        {
            let mut state = self.buffer.write();
            info!(
                "Buffer finished for {}: was buffering {}",
                self.info_hash,
                state.is_buffering()
            );
            state.finish();
        }
        if let Some(layout) = self.layout.get() {
            layout.demand.clear();
        }

        self.engine_session.restore_limits();
    }

    pub fn buffer_phase(&self) -> BufferPhase {
        self.buffer.read().phase()
    }

    pub fn is_buffering(&self) -> bool {
        self.buffer.read().is_buffering()
    }

    pub fn is_buffering_finished(&self) -> bool {
        self.buffer.read().is_finished()
    }

    /// Aggregate buffer progress in percent.
    pub fn buffer_progress(&self) -> f64 {
        self.buffer.read().progress()
    }

    // Piece scheduling

    /// Urgently requests `piece` and the two following pieces for a reader
    /// blocked on it. Deadlines are staggered by 100 ms.
    pub fn prioritize_piece(&self, piece: u32) {
        if self.is_buffering() {
            return;
        }
        let Some(engine) = self.live_engine() else {
            return;
        };
        if !engine.is_valid() {
            return;
        }
        let Ok(layout) = self.layout() else {
            return;
        };
        if layout.awaiting.contains(piece) {
            return;
        }

        let last = piece
            .saturating_add(3)
            .min(layout.pieces.piece_count);
        for index in piece..last {
            if layout.awaiting.contains(index) || self.completion.has_piece(index) {
                continue;
            }
            layout.awaiting.insert(index);
            engine.set_piece_deadline(index, (index - piece) * 100);
        }
    }

    /// Forgets awaited pieces and clears every engine deadline.
    pub fn clear_deadlines(&self) {
        let Some(engine) = self.live_engine() else {
            return;
        };
        if let Some(layout) = self.layout.get() {
            layout.awaiting.clear();
        }
        engine.clear_piece_deadlines();
    }

    /// Reconciles piece priorities with current demand.
    ///
    /// Skipped while buffering without outstanding demand, while seeding,
    /// without playback or a trailing episode, and once closed. A plan whose
    /// fingerprint matches the last one pushed is not pushed again. At most
    /// one reconciliation runs at a time.
    pub fn prioritize_pieces(&self) {
        if self.is_closed() {
            return;
        }
        let Some(_running) = self.reconcile_guard.try_lock() else {
            debug!("Reconciliation already running for {}", self.info_hash);
            return;
        };

        if !self.has_metadata() && self.engine.has_metadata() {
            if let Err(e) = self.on_metadata_received() {
                debug!("Metadata not ready for {}: {e}", self.info_hash);
            }
        }
        let Ok(layout) = self.layout() else {
            return;
        };

        let buffering = self.is_buffering();
        if (buffering && layout.demand.is_empty())
            || self.is_seeding()
            || (!self.is_playing() && !self.is_next_file())
            || !self.engine.is_valid()
        {
            return;
        }

        let connections = self.connections();
        let (down, up) = self.humanized_rates();
        debug!(
            "Prioritizing pieces: {}% / {} / {}, Con: {}/{} + {}/{}",
            self.real_progress() as u32,
            down,
            up,
            connections.seeds,
            connections.seeds_total,
            connections.peers,
            connections.peers_total
        );

        self.reset_readers();

        let memory = self.storage.is_memory();
        let reader_ranges = self.readers.demand_ranges(&layout.pieces);
        let chosen: Vec<PieceRange> = if memory {
            Vec::new()
        } else {
            let chosen = self.chosen.lock();
            layout
                .files
                .iter()
                .filter(|file| chosen.contains(&file.index))
                .map(|file| file.pieces)
                .collect()
        };

        let mut plan = PriorityPlan::build(&PlanInputs {
            piece_count: layout.pieces.piece_count,
            reader_ranges: &reader_ranges,
            awaiting: &layout.awaiting,
            demand: &layout.demand,
            chosen: &chosen,
        });

        let queue = self.engine.download_queue();
        let completed = update_piece_progress(
            plan.tracked_mut(),
            |piece| self.completion.has_piece(piece),
            &queue,
        );
        for piece in completed {
            layout.awaiting.remove(piece);
            layout.demand.remove(piece);
        }

        let status = plan.status_line();
        if !status.is_empty() {
            debug!("Priorities: {status}");
        }
        *self.piece_status.lock() = status;

        let fingerprint = plan.fingerprint();
        {
            let mut last = self.last_fingerprint.lock();
            if *last == Some(fingerprint) {
                debug!("Skipping prioritization due to stale priorities");
                return;
            }
            if self.is_closed() {
                return;
            }
            *last = Some(fingerprint);
        }

        let Some(engine) = self.live_engine() else {
            return;
        };

        if memory {
            if let Some(storage) = self.memory_storage.lock().clone() {
                storage.set_reader_pieces(plan.reader_pieces());
                storage.set_reserved_pieces(&self.reserved.lock());
            }
        }

        engine.prioritize_pieces(plan.priorities());
    }

    /// Whether `piece` is complete, per the throttled completion view.
    pub fn has_piece(&self, piece: u32) -> bool {
        self.completion.has_piece(piece)
    }

    /// Per-piece status of the last reconciliation.
    pub fn piece_status(&self) -> String {
        self.piece_status.lock().clone()
    }

    // Readers

    /// Opens a reader on `file` at `position` bytes into it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - The session is closed
    pub fn open_reader(
        self: &Arc<Self>,
        file: &TorrentFile,
        position: u64,
    ) -> Result<ReaderHandle, TorrentError> {
        if self.is_closed() {
            return Err(TorrentError::TorrentNotFound {
                info_hash: self.info_hash,
            });
        }

        let id = self.readers.register(file, position);
        debug!("Opened reader {id} on {} at {position}", file.path);
        self.reset_readers();

        Ok(ReaderHandle {
            id,
            session: Arc::downgrade(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Closes a reader and redistributes readahead among the rest.
    pub fn close_reader(&self, id: ReaderId) {
        if self.readers.remove(id) {
            debug!("Closed reader {id}");
            self.reset_readers();
        }
    }

    /// Closes every reader, returning how many were open.
    pub fn close_readers(&self) -> usize {
        let closed = self.readers.drain();
        for id in &closed {
            debug!("Closing active reader: {id}");
        }
        closed.len()
    }

    /// Reclassifies readers and redistributes the readahead budget.
    pub fn reset_readers(&self) {
        if self.readers.is_empty() {
            return;
        }
        self.readers.reset(self.readahead_size());
    }

    pub fn readers_readahead_sum(&self) -> u64 {
        self.readers.readahead_sum()
    }

    pub fn readers(&self) -> Vec<ReaderInfo> {
        self.readers.snapshot()
    }

    // Files

    pub fn files(&self) -> Vec<TorrentFile> {
        self.layout
            .get()
            .map(|layout| layout.files.as_slice().to_vec())
            .unwrap_or_default()
    }

    pub fn file_by_path(&self, path: &str) -> Option<TorrentFile> {
        self.layout.get()?.files.by_path(path).cloned()
    }

    pub fn file_by_index(&self, index: usize) -> Option<TorrentFile> {
        self.layout.get()?.files.by_index(index).cloned()
    }

    /// First file whose name matches `season`/`episode`.
    pub fn next_episode_file(&self, season: u32, episode: u32) -> Option<TorrentFile> {
        let pattern = episodes::episode_pattern(season, episode).ok()?;
        self.layout
            .get()?
            .files
            .iter()
            .find(|file| pattern.is_match(&file.path))
            .cloned()
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.chosen.lock().contains(&index)
    }

    pub fn chosen_files(&self) -> Vec<TorrentFile> {
        let chosen = self.chosen.lock().clone();
        self.files()
            .into_iter()
            .filter(|file| chosen.contains(&file.index))
            .collect()
    }

    /// Adds `file` to the chosen set. Disk-backed sessions also enable it in
    /// the engine.
    pub fn download_file(&self, file: &TorrentFile) {
        self.chosen.lock().insert(file.index);
        if self.storage.is_memory() {
            return;
        }
        if let Some(engine) = self.live_engine() {
            debug!("Choosing file for download: {}", file.path);
            engine.set_file_priority(file.index, PiecePriority::Background);
        }
    }

    /// Removes `file` from the chosen set. Returns false if it was not
    /// chosen.
    pub fn undownload_file(&self, file: &TorrentFile) -> bool {
        if !self.chosen.lock().remove(&file.index) {
            return false;
        }
        debug!("UnChoosing file for download: {}", file.path);
        if self.storage.is_memory() {
            return true;
        }
        if let Some(engine) = self.live_engine() {
            engine.set_file_priority(file.index, PiecePriority::Skip);
        }
        true
    }

    pub fn download_all_files(&self) {
        for file in self.files() {
            self.download_file(&file);
        }
    }

    pub fn undownload_all_files(&self) {
        for file in self.chosen_files() {
            self.undownload_file(&file);
        }
    }

    /// True while some file is not chosen yet.
    pub fn has_available_files(&self) -> bool {
        self.chosen.lock().len() < self.layout.get().map_or(0, |layout| layout.files.len())
    }

    // Status

    pub fn pause(&self) {
        let Some(engine) = self.live_engine() else {
            return;
        };
        info!("Pausing torrent: {}", self.info_hash);
        engine.pause();
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let Some(engine) = self.live_engine() else {
            return;
        };
        info!("Resuming torrent: {}", self.info_hash);
        engine.resume();
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the engine reports the torrent as paused.
    pub fn is_paused(&self) -> bool {
        if !self.engine.is_valid() {
            return false;
        }
        self.engine
            .status()
            .map_or(self.paused.load(Ordering::SeqCst), |status| status.paused)
    }

    pub fn status(&self) -> SessionStatus {
        let memory = self.storage.is_memory();
        let buffering = self.is_buffering();

        if memory {
            if buffering {
                return SessionStatus::Buffering;
            } else if self.is_playing() {
                return SessionStatus::Playing;
            }
        }

        if !self.engine.is_valid() {
            return SessionStatus::Queued;
        }
        let Ok(status) = self.engine.status() else {
            return SessionStatus::Queued;
        };

        let progress = status.progress * 100.0;
        let state = status.state;

        if self.engine_session.is_paused() {
            SessionStatus::Paused
        } else if status.paused
            && state != TorrentState::Finished
            && state != TorrentState::Finding
        {
            if progress >= 100.0 {
                SessionStatus::Finished
            } else {
                SessionStatus::Paused
            }
        } else if !status.paused && (state == TorrentState::Finished || progress >= 100.0) {
            if memory {
                SessionStatus::Queued
            } else {
                state.into()
            }
        } else if state != TorrentState::Queued && buffering {
            SessionStatus::Buffering
        } else {
            state.into()
        }
    }

    pub fn state_label(&self) -> &'static str {
        self.status().label()
    }

    /// Progress in percent. Memory-backed sessions report playback progress
    /// when the player knows the duration, since only a window of pieces is
    /// ever held.
    pub fn progress(&self, playback: Option<PlaybackPosition>) -> f64 {
        if self.is_closed() {
            return 0.0;
        }

        if self.storage.is_memory() {
            if let Some(position) = playback.filter(|p| !p.duration.is_zero()) {
                self.real_progress();
                let watched = position.watched.as_secs_f64() / position.duration.as_secs_f64();
                return (watched * 100.0).min(100.0);
            }
        }

        self.real_progress()
    }

    /// Engine-reported download progress in percent; the previous value when
    /// the engine cannot report.
    pub fn real_progress(&self) -> f64 {
        let mut last = self.last_progress.lock();
        if let Ok(status) = self.engine.status() {
            *last = status.progress * 100.0;
        }
        *last
    }

    pub fn connections(&self) -> Connections {
        if !self.engine.is_valid() {
            return Connections::default();
        }
        let Ok(status) = self.engine.status() else {
            return Connections::default();
        };

        let seeds_total = match status.scrape_complete {
            Some(complete) if complete > 0 => complete,
            _ => status.list_seeds,
        };
        let peers_total = match (status.scrape_complete, status.scrape_incomplete) {
            (Some(complete), Some(incomplete)) if complete + incomplete > 0 => {
                complete + incomplete
            }
            _ => status.list_peers,
        };

        Connections {
            seeds: status.connected_seeds,
            seeds_total,
            peers: status.connected_peers.saturating_sub(status.connected_seeds),
            peers_total,
        }
    }

    /// Download and upload payload rates in bytes per second.
    pub fn transfer_rates(&self) -> (u64, u64) {
        if !self.engine.is_valid() {
            return (0, 0);
        }
        self.engine
            .status()
            .map_or((0, 0), |status| (status.download_rate, status.upload_rate))
    }

    pub fn humanized_rates(&self) -> (String, String) {
        let (down, up) = self.transfer_rates();
        (format_bytes_per_second(down), format_bytes_per_second(up))
    }

    // Teardown

    /// Tears the session down: cancels, closes all readers, then removes the
    /// torrent from the engine and deletes persisted artifacts in the
    /// background.
    ///
    /// The `.torrent` file is always deleted; resume data and parts files
    /// only when files are removed or storage is memory-backed.
    pub fn drop_torrent(self: &Arc<Self>, remove_files: bool) -> JoinHandle<()> {
        info!("Dropping torrent: {}", self.name());
        let was_buffering = self.is_buffering();

        self.close();
        self.close_readers();

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session
                .engine_session
                .remove_torrent(session.info_hash, remove_files)
            {
                error!("Could not remove torrent: {e}");
            }
            if was_buffering {
                session.engine_session.restore_limits();
            }

            let artifacts = &session.artifacts;
            let mut targets = vec![&artifacts.torrent_file];
            if remove_files || session.storage.is_memory() {
                targets.push(&artifacts.fast_resume);
                targets.push(&artifacts.parts);
            }

            for path in targets {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => info!("Deleted {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => error!("Could not delete {}: {e}", path.display()),
                }
            }
        })
    }
}

/// An open read cursor on a torrent file.
///
/// Dropping the handle closes the reader.
#[derive(Debug)]
pub struct ReaderHandle {
    id: ReaderId,
    session: Weak<TorrentSession>,
    closed: AtomicBool,
}

impl ReaderHandle {
    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// Moves the cursor to `position` bytes into the file.
    pub fn seek(&self, position: u64) {
        if let Some(session) = self.session.upgrade() {
            session.readers.seek(self.id, position);
        }
    }

    /// Advances the cursor after a read of `len` bytes.
    pub fn record_read(&self, len: u64) {
        if let Some(session) = self.session.upgrade() {
            session.readers.record_read(self.id, len);
        }
    }

    /// Readahead currently assigned to this reader.
    pub fn readahead(&self) -> u64 {
        self.session
            .upgrade()
            .and_then(|session| session.readers.readahead(self.id))
            .unwrap_or(0)
    }

    /// Reports that the reader is blocked on `piece`.
    pub fn wait_for_piece(&self, piece: u32) {
        if let Some(session) = self.session.upgrade() {
            session.prioritize_piece(piece);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.close_reader(self.id);
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("info_hash", &self.info_hash)
            .field("closed", &self.is_closed())
            .field("buffer_phase", &self.buffer_phase())
            .field("readers", &self.readers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_mocks::{
        EngineCall, MockEngine, MockEngineSession, MockMemoryProbe, piece_priorities,
    };
    use crate::engine::SwarmStatus;
    use crate::config::StorageKind;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        engine: Arc<MockEngine>,
        engine_session: Arc<MockEngineSession>,
        session: Arc<TorrentSession>,
    }

    fn fixture(engine: MockEngine, config: UndertowConfig) -> Fixture {
        let engine = Arc::new(engine);
        let engine_session = Arc::new(MockEngineSession::default());
        let session = TorrentSession::new(SessionContext {
            engine: engine.clone(),
            engine_session: engine_session.clone(),
            memory_probe: Arc::new(MockMemoryProbe::new(8192 * MIB, 4096 * MIB)),
            config: Arc::new(config),
            parent: CancellationToken::new(),
        });
        Fixture {
            engine,
            engine_session,
            session,
        }
    }

    fn file_config() -> UndertowConfig {
        let mut config = UndertowConfig::for_testing();
        config.storage.kind = StorageKind::File;
        config
    }

    #[test]
    fn test_metadata_builds_file_table() {
        let fx = fixture(
            MockEngine::with_files(MIB, &[("a.mkv", 3 * MIB), ("b.mkv", 5 * MIB)]),
            file_config(),
        );

        assert!(fx.session.has_metadata());
        assert_eq!(fx.session.files().len(), 2);
        assert_eq!(
            fx.session.file_by_path("b.mkv").unwrap().pieces,
            PieceRange::new(3, 7)
        );
        assert_eq!(fx.session.length(), 8 * MIB);
    }

    #[test]
    fn test_startup_buffer_pushes_one_vector() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();

        fx.session.buffer(Some(&file), true);

        assert!(fx.session.is_buffering());
        assert_eq!(fx.engine.prioritize_calls(), 1);
        let vector = fx.engine.last_priorities();
        // 4 MiB head and 1 MiB tail at the top level
        assert!(vector[..4].iter().all(|p| *p == PiecePriority::Overdue));
        assert_eq!(vector[4], PiecePriority::Background);
        assert_eq!(vector[63], PiecePriority::Overdue);
        assert_eq!(fx.engine_session.limits_applied(), 1);
        assert!(fx.engine.calls().contains(&EngineCall::Reannounce));
    }

    #[test]
    fn test_rebuffer_raises_window_pieces_before_deadlines() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();

        fx.session.buffer(Some(&file), false);

        let calls = fx.engine.calls();
        assert_eq!(fx.engine.prioritize_calls(), 0);

        let priorities = piece_priorities(&calls);
        assert_eq!(priorities.len(), 5);
        assert!(priorities.values().all(|p| *p == PiecePriority::Demand));

        let last_priority = calls
            .iter()
            .rposition(|call| matches!(call, EngineCall::Priority(..)))
            .unwrap();
        let first_deadline = calls
            .iter()
            .position(|call| matches!(call, EngineCall::Deadline(..)))
            .unwrap();
        assert!(last_priority < first_deadline);
        assert_eq!(fx.session.layout().unwrap().demand().len(), 5);
    }

    #[test]
    fn test_memory_buffer_grows_window_to_fit() {
        let mut config = UndertowConfig::for_testing();
        config.storage.memory_size = 2 * MIB;
        config.streaming.buffer_size = 16 * MIB;
        config.streaming.end_buffer_size = 4 * MIB;

        let fx = fixture(
            MockEngine::with_pieces(128, MIB).with_memory_storage(),
            config,
        );
        let file = fx.session.file_by_index(0).unwrap();
        fx.session.buffer(Some(&file), true);

        // Floor of ten pieces, then grown to hold both windows plus a piece
        assert_eq!(fx.session.memory_size(), 21 * MIB);
        assert_eq!(fx.engine.memory().unwrap().memory_size(), 21 * MIB);
        assert_eq!(fx.engine.last_priorities()[30], PiecePriority::Skip);
    }

    #[test]
    fn test_buffer_progress_reaches_full_once() {
        let fx = fixture(MockEngine::with_pieces(32, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();
        fx.session.buffer(Some(&file), true);

        fx.engine.set_partial(0, MIB);
        fx.session.buffer_tick();
        let partial = fx.session.buffer_progress();
        assert!(partial > 0.0 && partial < 100.0);

        fx.engine.complete_all();
        fx.session.buffer_tick();
        assert_eq!(fx.session.buffer_progress(), 100.0);

        fx.session.buffer_finished();
        assert!(fx.session.is_buffering_finished());
        assert_eq!(fx.engine_session.limits_restored(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_after_startup_buffer_restores_plan() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        fx.session.set_playing(true);
        let file = fx.session.file_by_index(0).unwrap();
        let _reader = fx.session.open_reader(&file, 20 * MIB).unwrap();

        fx.session.prioritize_pieces();
        fx.session.buffer(Some(&file), true);
        fx.session.buffer_finished();
        fx.session.prioritize_pieces();

        // The startup vector overwrote the engine, so the same plan goes out again.
        assert_eq!(fx.engine.prioritize_calls(), 3);
        let vector = fx.engine.last_priorities();
        assert_eq!(vector[20], PiecePriority::Head);
        assert_eq!(vector[0], PiecePriority::Skip);
    }

    #[tokio::test]
    async fn test_reconcile_drops_completed_demand_pieces() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();
        fx.session.buffer(Some(&file), false);
        assert_eq!(fx.session.layout().unwrap().demand().len(), 5);

        for piece in 0..4 {
            fx.engine.complete_piece(piece);
        }
        fx.session.set_playing(true);
        let _reader = fx.session.open_reader(&file, 0).unwrap();
        fx.session.prioritize_pieces();

        assert_eq!(fx.session.layout().unwrap().demand().to_vec(), vec![63]);
    }

    #[tokio::test]
    async fn test_finished_buffer_leaves_no_demand_in_memory_plan() {
        let fx = fixture(
            MockEngine::with_pieces(128, MIB).with_memory_storage(),
            UndertowConfig::for_testing(),
        );
        let file = fx.session.file_by_index(0).unwrap();
        fx.session.buffer(Some(&file), false);
        fx.engine.complete_all();
        fx.session.buffer_tick();
        fx.session.buffer_finished();
        assert!(fx.session.layout().unwrap().demand().is_empty());

        fx.session.set_playing(true);
        let _reader = fx.session.open_reader(&file, 60 * MIB).unwrap();
        fx.session.prioritize_pieces();

        let pieces = fx.engine.memory().unwrap().reader_pieces();
        assert_eq!(pieces.first(), Some(&60));
        assert!(!pieces.contains(&0));
        assert!(!pieces.contains(&127));
    }

    #[test]
    fn test_buffer_skips_limits_when_closed_during_setup() {
        struct ClosingProbe {
            session: Mutex<Weak<TorrentSession>>,
        }

        impl MemoryProbe for ClosingProbe {
            fn memory_stats(&self) -> memory::MemoryStats {
                if let Some(session) = self.session.lock().upgrade() {
                    session.close();
                }
                memory::MemoryStats {
                    total: 8192 * MIB,
                    free: 4096 * MIB,
                }
            }
        }

        let mut config = UndertowConfig::for_testing();
        config.streaming.auto_adjust_memory_size = true;
        let engine = Arc::new(MockEngine::with_pieces(64, MIB).with_memory_storage());
        let engine_session = Arc::new(MockEngineSession::default());
        let probe = Arc::new(ClosingProbe {
            session: Mutex::new(Weak::new()),
        });
        let session = TorrentSession::new(SessionContext {
            engine: engine.clone(),
            engine_session: engine_session.clone(),
            memory_probe: probe.clone(),
            config: Arc::new(config),
            parent: CancellationToken::new(),
        });
        *probe.session.lock() = Arc::downgrade(&session);

        let file = session.file_by_index(0).unwrap();
        session.buffer(Some(&file), true);

        assert!(session.is_closed());
        assert!(!session.is_buffering());
        assert_eq!(engine_session.limits_applied(), 0);
        assert_eq!(engine.prioritize_calls(), 0);
    }

    #[test]
    fn test_missing_file_finishes_buffering() {
        let fx = fixture(MockEngine::with_pieces(8, MIB), file_config());
        fx.session.buffer(None, true);
        assert_eq!(fx.session.buffer_phase(), BufferPhase::Finished);
        assert_eq!(fx.engine.mutation_count(), 0);
    }

    #[test]
    fn test_prioritize_piece_staggers_deadlines() {
        let fx = fixture(MockEngine::with_pieces(16, MIB), file_config());
        fx.engine.complete_piece(6);

        fx.session.prioritize_piece(5);

        assert_eq!(fx.engine.deadlines(), vec![(5, 0), (7, 200)]);
        let awaiting = fx.session.layout().unwrap().awaiting();
        assert_eq!(awaiting.to_vec(), vec![5, 7]);

        // Already awaiting
        fx.session.prioritize_piece(5);
        assert_eq!(fx.engine.deadlines().len(), 2);

        fx.session.clear_deadlines();
        assert!(awaiting.is_empty());
        assert!(fx.engine.calls().contains(&EngineCall::ClearDeadlines));
    }

    #[test]
    fn test_prioritize_piece_stops_at_last_piece() {
        let fx = fixture(MockEngine::with_pieces(4, MIB), file_config());
        fx.session.prioritize_piece(3);
        assert_eq!(fx.engine.deadlines(), vec![(3, 0)]);
    }

    #[tokio::test]
    async fn test_reconcile_skipped_without_playback() {
        let fx = fixture(MockEngine::with_pieces(16, MIB), file_config());
        fx.session.prioritize_pieces();
        assert_eq!(fx.engine.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_pushes_reader_window_and_memory_pieces() {
        let fx = fixture(
            MockEngine::with_pieces(64, MIB).with_memory_storage(),
            UndertowConfig::for_testing(),
        );
        fx.session.adjust_memory_size(16 * MIB);
        fx.session.set_reserved_pieces(vec![63]);
        fx.session.set_playing(true);

        let file = fx.session.file_by_index(0).unwrap();
        let reader = fx.session.open_reader(&file, 10 * MIB).unwrap();
        // 16 MiB window minus reserved and two spare pieces
        assert_eq!(reader.readahead(), 13 * MIB);

        fx.session.prioritize_pieces();

        let vector = fx.engine.last_priorities();
        assert_eq!(vector[10], PiecePriority::Head);
        assert_eq!(vector[9], PiecePriority::Skip);
        assert_eq!(vector[22], PiecePriority::Trailing);
        assert_eq!(vector[23], PiecePriority::Skip);

        let storage = fx.engine.memory().unwrap();
        assert_eq!(storage.reader_pieces(), (10..=22).collect::<Vec<u32>>());
        assert_eq!(storage.reserved_pieces(), vec![63]);
        assert!(fx.session.piece_status().starts_with("[10:6:0"));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        fx.session.set_playing(true);
        let file = fx.session.file_by_index(0).unwrap();
        let _reader = fx.session.open_reader(&file, 0).unwrap();

        fx.session.prioritize_pieces();
        fx.session.prioritize_pieces();

        assert_eq!(fx.engine.prioritize_calls(), 1);
    }

    #[tokio::test]
    async fn test_reader_close_triggers_reallocation() {
        let fx = fixture(MockEngine::with_pieces(64, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();

        let first = fx.session.open_reader(&file, 0).unwrap();
        let second = fx.session.open_reader(&file, 20 * MIB).unwrap();
        assert_eq!(fx.session.readers_readahead_sum(), 8 * MIB);
        assert_eq!(first.readahead() + second.readahead(), 8 * MIB);

        drop(second);
        assert_eq!(fx.session.readers().len(), 1);
        assert_eq!(first.readahead(), 8 * MIB);

        first.close();
        first.close();
        assert!(fx.session.readers().is_empty());
    }

    #[test]
    fn test_file_selection_on_disk_storage() {
        let fx = fixture(
            MockEngine::with_files(MIB, &[("a.mkv", 3 * MIB), ("b.mkv", 5 * MIB)]),
            file_config(),
        );
        let a = fx.session.file_by_index(0).unwrap();

        assert!(fx.session.has_available_files());
        fx.session.download_file(&a);
        assert!(fx.session.is_selected(0));
        assert!(
            fx.engine
                .calls()
                .contains(&EngineCall::FilePriority(0, PiecePriority::Background))
        );

        fx.session.download_all_files();
        assert!(!fx.session.has_available_files());

        fx.session.undownload_all_files();
        assert!(fx.session.chosen_files().is_empty());
        assert!(!fx.session.undownload_file(&a));
    }

    #[test]
    fn test_next_episode_lookup() {
        let fx = fixture(
            MockEngine::with_files(
                MIB,
                &[("Show/Show.S01E01.mkv", 3 * MIB), ("Show/Show.S01E02.mkv", 3 * MIB)],
            ),
            file_config(),
        );

        assert_eq!(fx.session.next_episode_file(1, 2).unwrap().index, 1);
        assert!(fx.session.next_episode_file(1, 3).is_none());
    }

    #[test]
    fn test_status_labels() {
        let fx = fixture(MockEngine::with_pieces(8, MIB), file_config());
        assert_eq!(fx.session.state_label(), "Queued");

        fx.engine.set_status(SwarmStatus {
            state: TorrentState::Downloading,
            progress: 0.4,
            ..SwarmStatus::default()
        });
        assert_eq!(fx.session.status(), SessionStatus::Downloading);
        assert!((fx.session.real_progress() - 40.0).abs() < 1e-9);

        fx.engine.set_status(SwarmStatus {
            state: TorrentState::Downloading,
            progress: 0.4,
            paused: true,
            ..SwarmStatus::default()
        });
        assert_eq!(fx.session.status(), SessionStatus::Paused);

        fx.engine_session.set_paused(false);
        fx.engine.set_valid(false);
        assert_eq!(fx.session.status(), SessionStatus::Queued);
    }

    #[test]
    fn test_playback_progress_for_memory_storage() {
        let fx = fixture(
            MockEngine::with_pieces(8, MIB).with_memory_storage(),
            UndertowConfig::for_testing(),
        );
        let progress = fx.session.progress(Some(PlaybackPosition {
            watched: Duration::from_secs(30),
            duration: Duration::from_secs(120),
        }));
        assert_eq!(progress, 25.0);
    }

    #[test]
    fn test_playback_progress_is_capped() {
        let fx = fixture(
            MockEngine::with_pieces(8, MIB).with_memory_storage(),
            UndertowConfig::for_testing(),
        );
        let progress = fx.session.progress(Some(PlaybackPosition {
            watched: Duration::from_secs(150),
            duration: Duration::from_secs(120),
        }));
        assert_eq!(progress, 100.0);
    }

    #[test]
    fn test_connection_counts_fall_back_to_lists() {
        let fx = fixture(MockEngine::with_pieces(8, MIB), file_config());
        fx.engine.set_status(SwarmStatus {
            connected_seeds: 2,
            connected_peers: 5,
            scrape_complete: None,
            list_seeds: 7,
            list_peers: 30,
            download_rate: 2048,
            ..SwarmStatus::default()
        });

        assert_eq!(
            fx.session.connections(),
            Connections {
                seeds: 2,
                seeds_total: 7,
                peers: 3,
                peers_total: 30,
            }
        );
        assert_eq!(fx.session.humanized_rates().0, "2.0 KB/s");
    }

    #[tokio::test]
    async fn test_wait_for_metadata_outcomes() {
        let fx = fixture(
            MockEngine::with_pieces(8, MIB).without_metadata(),
            file_config(),
        );
        assert!(!fx.session.has_metadata());

        let err = fx
            .session
            .wait_for_metadata(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TorrentError::MetadataTimeout { .. }));

        fx.engine.reveal_metadata();
        fx.session.on_metadata_received().unwrap();
        assert_eq!(
            fx.session.wait_for_metadata(Duration::from_secs(1)).await.unwrap(),
            MetadataWait::Received
        );
    }

    #[tokio::test]
    async fn test_wait_for_metadata_cancelled() {
        let fx = fixture(
            MockEngine::with_pieces(8, MIB).without_metadata(),
            file_config(),
        );
        fx.session.close();
        assert_eq!(
            fx.session.wait_for_metadata(Duration::from_secs(5)).await.unwrap(),
            MetadataWait::Cancelled
        );
    }

    #[tokio::test]
    async fn test_closed_session_never_mutates_engine() {
        let fx = fixture(MockEngine::with_pieces(32, MIB), file_config());
        let file = fx.session.file_by_index(0).unwrap();
        fx.session.set_playing(true);
        fx.session.close();

        fx.session.buffer(Some(&file), true);
        fx.session.buffer(Some(&file), false);
        fx.session.prioritize_pieces();
        fx.session.prioritize_piece(4);
        fx.session.clear_deadlines();
        fx.session.download_file(&file);
        fx.session.pause();
        fx.session.buffer_tick();

        assert_eq!(fx.engine.mutation_count(), 0);
        assert!(fx.session.open_reader(&file, 0).is_err());
    }
}
