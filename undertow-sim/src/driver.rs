//! Clock that moves simulated engines forward.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::SimulatedEngine;

/// Advances `engine` every `tick` by the time actually elapsed until
/// `cancel` fires.
pub fn spawn_driver(
    engine: Arc<SimulatedEngine>,
    tick: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut last = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Simulation driver stopped");
                    break;
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    engine.advance(now - last);
                    last = now;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use undertow_core::{PiecePriority, TorrentEngine};

    use super::*;
    use crate::swarm::{SimTorrent, SwarmConfig};

    const MIB: u64 = 1024 * 1024;

    #[tokio::test(start_paused = true)]
    async fn test_driver_downloads_until_cancelled() {
        let engine = Arc::new(SimulatedEngine::new(
            SimTorrent::new("Movie", MIB).with_file("movie.mkv", 16 * MIB),
            SwarmConfig {
                bytes_per_second: MIB,
                jitter_percent: 0,
                ..SwarmConfig::default()
            },
        ));
        engine.set_file_priority(0, PiecePriority::Background);
        let cancel = CancellationToken::new();
        let handle = spawn_driver(engine.clone(), Duration::from_millis(250), cancel.clone());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(engine.completed_count(), 3);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.completed_count(), 3);
    }
}
