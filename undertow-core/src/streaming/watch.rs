//! Per-session watch loop.
//!
//! One task per session multiplexes the buffer tick, the reconciliation tick,
//! the trailing-episode timer, session commands and cancellation. Fired
//! handlers run as their own tasks so a slow engine call never delays the
//! timers; handlers guard themselves against overlapping runs.

use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::session::TorrentSession;
use crate::torrent::InfoHash;

/// Signals from a session to its watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCommand {
    /// Buffering (re)started; resume buffer ticks
    RestartBufferTicker,
    /// Buffer progress reached 100%
    BufferFinished,
    ArmTrailingTimer(Duration),
    DisarmTrailingTimer,
}

/// Owner of sessions, asked to release one when its trailing timer fires.
pub trait SessionOwner: Send + Sync {
    fn release(&self, info_hash: InfoHash);
}

/// Far enough in the future to stand for a disarmed timer.
const DISARMED: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Spawns the watch loop of `session`.
///
/// Returns `None` if the loop was already started.
pub fn spawn_watch(
    session: Arc<TorrentSession>,
    owner: Weak<dyn SessionOwner>,
) -> Option<JoinHandle<()>> {
    let commands = session.take_commands()?;
    Some(tokio::spawn(run_watch(session, commands, owner)))
}

async fn run_watch(
    session: Arc<TorrentSession>,
    mut commands: mpsc::UnboundedReceiver<WatchCommand>,
    owner: Weak<dyn SessionOwner>,
) {
    let info_hash = session.info_hash();
    let cancel = session.cancellation_token().clone();
    let config = session.config().clone();

    let mut buffer_ticker = time::interval(config.buffer_tick);
    buffer_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut prioritize_ticker = time::interval(config.prioritize_tick);
    prioritize_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buffer_active = session.is_buffering();
    let mut trailing_armed = false;
    let mut trailing = pin!(time::sleep(DISARMED));
    let mut commands_open = true;

    debug!("Watch loop started for {info_hash}");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            command = commands.recv(), if commands_open => match command {
                Some(WatchCommand::RestartBufferTicker) => {
                    buffer_active = true;
                    buffer_ticker.reset();
                }
                Some(WatchCommand::BufferFinished) => {
                    buffer_active = false;
                    let session = Arc::clone(&session);
                    tokio::spawn(async move { session.buffer_finished() });
                }
                Some(WatchCommand::ArmTrailingTimer(delay)) => {
                    info!("Starting trailing episode timer for {info_hash}: {delay:?}");
                    trailing_armed = true;
                    trailing.as_mut().reset(Instant::now() + delay);
                }
                Some(WatchCommand::DisarmTrailingTimer) => {
                    trailing_armed = false;
                    trailing.as_mut().reset(Instant::now() + DISARMED);
                }
                None => commands_open = false,
            },

            _ = buffer_ticker.tick(), if buffer_active => {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.buffer_tick() });
            }

            _ = prioritize_ticker.tick() => {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.prioritize_pieces() });
            }

            _ = &mut trailing, if trailing_armed => {
                trailing_armed = false;
                info!("Trailing episode timer fired for {info_hash}, releasing session");
                match owner.upgrade() {
                    Some(owner) => owner.release(info_hash),
                    None => session.close(),
                }
            }
        }
    }

    debug!("Watch loop stopped for {info_hash}");
}
