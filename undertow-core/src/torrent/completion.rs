//! Throttled, cached view of which pieces the engine has completed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{TorrentError, TorrentState};
use crate::engine::TorrentEngine;

/// Byte-packed completion bitmap, most significant bit first.
///
/// Copied out of the engine as a value snapshot; never shares memory with
/// the engine's own bitfield.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Wraps raw bytes holding `len` bits. Missing trailing bytes read as
    /// unset.
    pub fn from_bytes(bytes: Vec<u8>, len: u32) -> Self {
        Self { bytes, len }
    }

    /// Builds a bitfield from per-piece flags.
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut bytes = vec![0u8; flags.len().div_ceil(8)];
        for (index, _) in flags.iter().enumerate().filter(|(_, set)| **set) {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }
        Self {
            bytes,
            len: flags.len() as u32,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes
            .get((index / 8) as usize)
            .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    pub fn count_ones(&self) -> u32 {
        (0..self.len).filter(|index| self.get(*index)).count() as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Default)]
struct CompletionSnapshot {
    bits: Bitfield,
    refreshed_at: Option<Instant>,
}

/// Completion state cached from the engine and refreshed no more often than
/// `refresh_interval`.
pub struct CompletionView {
    engine: Arc<dyn TorrentEngine>,
    cancel: CancellationToken,
    refresh_interval: Duration,
    snapshot: RwLock<CompletionSnapshot>,
}

impl CompletionView {
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        cancel: CancellationToken,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            engine,
            cancel,
            refresh_interval,
            snapshot: RwLock::new(CompletionSnapshot::default()),
        }
    }

    fn is_fresh(&self, snapshot: &CompletionSnapshot) -> bool {
        snapshot
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.refresh_interval)
    }

    /// Re-reads the engine bitfield unless the cached copy is still fresh or
    /// the session is closed. Returns true when a new snapshot was taken.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidState` - Engine reports a state past seeding
    /// - Any error returned by the engine's bitfield query
    pub fn refresh(&self) -> Result<bool, TorrentError> {
        if self.cancel.is_cancelled() || self.is_fresh(&self.snapshot.read()) {
            return Ok(false);
        }

        let mut snapshot = self.snapshot.write();
        if self.is_fresh(&snapshot) {
            return Ok(false);
        }

        let raw = self.engine.piece_bitfield()?;
        TorrentState::try_from(raw.state)?;

        snapshot.bits = Bitfield::from_bytes(raw.bits, raw.len);
        snapshot.refreshed_at = Some(Instant::now());
        Ok(true)
    }

    /// Whether the engine has completed `piece`. A failed refresh answers
    /// from the last good snapshot.
    pub fn has_piece(&self, piece: u32) -> bool {
        if let Err(e) = self.refresh() {
            warn!("Completion refresh failed: {e}");
        }
        self.snapshot.read().bits.get(piece)
    }

    /// Copy of the cached bitfield, refreshed first if stale.
    pub fn bitfield(&self) -> Bitfield {
        let _ = self.refresh();
        self.snapshot.read().bits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_mocks::MockEngine;

    #[test]
    fn test_bitfield_msb_first() {
        let bits = Bitfield::from_bytes(vec![0b1000_0001, 0b0100_0000], 10);

        assert!(bits.get(0));
        assert!(bits.get(7));
        assert!(bits.get(9));
        assert!(!bits.get(1));
        assert!(!bits.get(10));
        assert_eq!(bits.count_ones(), 3);

        let mut flags = vec![false; 10];
        flags[0] = true;
        flags[7] = true;
        flags[9] = true;
        assert_eq!(Bitfield::from_flags(&flags), bits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_throttled() {
        let engine = Arc::new(MockEngine::with_pieces(16, 1024));
        let view = CompletionView::new(
            engine.clone(),
            CancellationToken::new(),
            Duration::from_millis(500),
        );

        assert!(!view.has_piece(3));
        engine.complete_piece(3);

        // Still served from the cached snapshot
        assert!(!view.has_piece(3));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(view.has_piece(3));
        assert_eq!(engine.bitfield_queries(), 2);
    }

    #[test]
    fn test_invalid_state_reads_as_incomplete() {
        let engine = Arc::new(MockEngine::with_pieces(4, 1024));
        engine.complete_piece(0);
        engine.set_raw_state(7);

        let view = CompletionView::new(engine, CancellationToken::new(), Duration::ZERO);
        assert!(matches!(
            view.refresh(),
            Err(TorrentError::InvalidState { state: 7 })
        ));
        assert!(!view.has_piece(0));
    }

    #[test]
    fn test_failed_refresh_keeps_last_snapshot() {
        let engine = Arc::new(MockEngine::with_pieces(4, 1024));
        engine.complete_piece(0);
        let view = CompletionView::new(engine.clone(), CancellationToken::new(), Duration::ZERO);
        assert!(view.has_piece(0));

        engine.set_raw_state(7);
        assert!(view.refresh().is_err());
        assert!(view.has_piece(0));
        assert!(!view.has_piece(1));
    }

    #[test]
    fn test_closed_view_skips_refresh() {
        let engine = Arc::new(MockEngine::with_pieces(4, 1024));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let view = CompletionView::new(engine.clone(), cancel, Duration::ZERO);
        assert!(!view.refresh().unwrap());
        assert_eq!(engine.bitfield_queries(), 0);
    }
}
