//! Buffer windows and buffering progress.
//!
//! Before playback starts the head and the tail of the chosen file must be
//! present: players probe the end of a file for container indexes right after
//! opening it. [`BufferWindows`] computes both windows, [`BufferState`] tracks
//! their completion until it reaches 100% exactly once.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::engine::{PartialPiece, PiecePriority};
use crate::torrent::{BufferWindow, PieceLayout, TorrentFile};

/// Highest progress a piece that is still downloading can report.
const PARTIAL_PROGRESS_CAP: f64 = 0.99;

/// Pre-buffer at the start of a file and post-buffer at its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferWindows {
    pub pre: BufferWindow,
    pub post: BufferWindow,
}

impl BufferWindows {
    /// Computes the two windows for `file`.
    pub fn for_file(
        layout: &PieceLayout,
        file: &TorrentFile,
        buffer_size: u64,
        end_buffer_size: u64,
    ) -> Self {
        let pre = layout.buffer_window(file.offset, 0, buffer_size);
        let post = layout.buffer_window(
            file.offset,
            file.size.saturating_sub(end_buffer_size),
            end_buffer_size,
        );
        Self { pre, post }
    }

    /// Bytes covered by both windows.
    pub fn total_bytes(&self) -> u64 {
        self.pre.size + self.post.size
    }

    /// Window pieces in order, pre-buffer first. Overlapping windows repeat
    /// pieces.
    pub fn pieces(&self) -> impl Iterator<Item = u32> {
        self.pre.pieces.iter().chain(self.post.pieces.iter())
    }

    /// One-shot startup vector: window pieces at the highest level,
    /// everything else at `default`.
    pub fn startup_vector(&self, piece_count: u32, default: PiecePriority) -> Vec<PiecePriority> {
        let mut priorities = vec![default; piece_count as usize];
        for piece in self.pieces() {
            if let Some(priority) = priorities.get_mut(piece as usize) {
                *priority = PiecePriority::Overdue;
            }
        }
        priorities
    }
}

/// Buffer readiness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPhase {
    #[default]
    NotBuffering,
    Buffering,
    Finished,
}

/// Result of one progress observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferTick {
    pub progress: f64,
    /// True only for the observation that first reached 100%
    pub reached_full: bool,
}

/// Buffering progress over the tracked window pieces.
#[derive(Debug, Default)]
pub struct BufferState {
    phase: BufferPhase,
    progress: f64,
    previous: f64,
    length: u64,
    pieces: BTreeMap<u32, f64>,
    pieces_length: u64,
    finish_signalled: bool,
}

impl BufferState {
    /// Starts tracking the pieces of `windows` from zero.
    pub fn begin(&mut self, windows: &BufferWindows, piece_length: u64) {
        self.phase = BufferPhase::Buffering;
        self.progress = 0.0;
        self.previous = 0.0;
        self.length = windows.total_bytes();
        self.finish_signalled = false;

        self.pieces.clear();
        for piece in windows.pieces() {
            self.pieces.insert(piece, 0.0);
        }
        self.pieces_length = self.pieces.len() as u64 * piece_length;
    }

    pub fn phase(&self) -> BufferPhase {
        self.phase
    }

    pub fn is_buffering(&self) -> bool {
        self.phase == BufferPhase::Buffering
    }

    pub fn is_finished(&self) -> bool {
        self.phase == BufferPhase::Finished
    }

    /// Bytes requested by the two windows.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes of all tracked pieces.
    pub fn pieces_length(&self) -> u64 {
        self.pieces_length
    }

    pub fn has_pieces(&self) -> bool {
        !self.pieces.is_empty()
    }

    pub fn pieces_mut(&mut self) -> &mut BTreeMap<u32, f64> {
        &mut self.pieces
    }

    /// Mean completion of the tracked pieces in percent.
    pub fn computed_progress(&self) -> f64 {
        if self.pieces.is_empty() {
            return self.progress;
        }
        let sum: f64 = self.pieces.values().sum();
        100.0 * sum / self.pieces.len() as f64
    }

    /// Last observed progress, capped at 100.
    pub fn progress(&self) -> f64 {
        self.progress.min(100.0)
    }

    /// Folds the current piece fractions into the aggregate progress.
    ///
    /// Progress never decreases; reaching 100% is reported once per buffering
    /// run.
    pub fn observe(&mut self) -> BufferTick {
        let computed = self.computed_progress();
        if computed > self.progress {
            self.progress = computed;
        }

        if self.progress >= 100.0 {
            let reached_full = !self.finish_signalled;
            self.finish_signalled = true;
            return BufferTick {
                progress: 100.0,
                reached_full,
            };
        }

        if self.previous > self.progress {
            self.progress = self.previous;
        } else {
            self.previous = self.progress;
        }

        BufferTick {
            progress: self.progress,
            reached_full: false,
        }
    }

    /// Ends buffering: clears the trackers and flips to finished. Returns
    /// false if no buffering was in progress.
    pub fn finish(&mut self) -> bool {
        let was_buffering = self.is_buffering();
        self.pieces.clear();
        self.phase = BufferPhase::Finished;
        was_buffering
    }

    /// Per-piece progress as `[index:percent, ...]`.
    pub fn pieces_status(&self) -> String {
        let mut status = String::from("[");
        for (index, (piece, fraction)) in self.pieces.iter().enumerate() {
            if index > 0 {
                status.push_str(", ");
            }
            let _ = write!(status, "{}:{}", piece, (fraction * 100.0) as u32);
        }
        status.push(']');
        status
    }
}

/// Updates `pieces` from the completion view and the engine download queue.
///
/// Complete pieces read 1.0; pieces still in the queue read their downloaded
/// fraction, capped below 1.0. Returns the pieces found complete.
pub fn update_piece_progress(
    pieces: &mut BTreeMap<u32, f64>,
    has_piece: impl Fn(u32) -> bool,
    queue: &[PartialPiece],
) -> Vec<u32> {
    let mut completed = Vec::new();
    for (piece, fraction) in pieces.iter_mut() {
        if has_piece(*piece) {
            *fraction = 1.0;
            completed.push(*piece);
        }
    }

    for partial in queue {
        if let Some(fraction) = pieces.get_mut(&partial.index) {
            if *fraction < 1.0 {
                *fraction = partial.fraction().min(PARTIAL_PROGRESS_CAP);
            }
        }
    }

    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceRange;

    const MIB: u64 = 1024 * 1024;

    fn movie(layout: &PieceLayout) -> TorrentFile {
        TorrentFile {
            index: 0,
            path: "Movie/movie.mkv".to_string(),
            name: "movie.mkv".to_string(),
            size: 100 * MIB,
            offset: 0,
            pieces: layout.byte_region_pieces(0, 100 * MIB),
        }
    }

    #[test]
    fn test_windows_cover_head_and_tail() {
        let layout = PieceLayout::new(MIB, 100, 100 * MIB);
        let windows = BufferWindows::for_file(&layout, &movie(&layout), 4 * MIB, 2 * MIB);

        assert_eq!(windows.pre.pieces, PieceRange::new(0, 3));
        assert_eq!(windows.post.pieces, PieceRange::new(98, 99));
        assert_eq!(windows.post.offset, 98 * MIB);
        assert_eq!(windows.total_bytes(), 6 * MIB);
    }

    #[test]
    fn test_startup_vector() {
        let layout = PieceLayout::new(MIB, 10, 10 * MIB);
        let file = TorrentFile {
            size: 10 * MIB,
            pieces: PieceRange::new(0, 9),
            ..movie(&layout)
        };
        let windows = BufferWindows::for_file(&layout, &file, 2 * MIB, MIB);
        let vector = windows.startup_vector(10, PiecePriority::Background);

        assert_eq!(vector[0], PiecePriority::Overdue);
        assert_eq!(vector[1], PiecePriority::Overdue);
        assert_eq!(vector[2], PiecePriority::Background);
        assert_eq!(vector[9], PiecePriority::Overdue);
        assert_eq!(vector.len(), 10);
    }

    fn buffering_state() -> BufferState {
        let layout = PieceLayout::new(MIB, 100, 100 * MIB);
        let windows = BufferWindows::for_file(&layout, &movie(&layout), 2 * MIB, MIB);
        let mut state = BufferState::default();
        state.begin(&windows, MIB);
        state
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut state = buffering_state();
        assert_eq!(state.pieces_length(), 3 * MIB);

        state.pieces_mut().insert(0, 0.9);
        let first = state.observe();
        assert!((first.progress - 30.0).abs() < 1e-9);

        // A piece evicted from the queue must not pull progress back
        state.pieces_mut().insert(0, 0.0);
        let second = state.observe();
        assert!((second.progress - 30.0).abs() < 1e-9);
        assert!(!second.reached_full);
    }

    #[test]
    fn test_full_progress_signalled_once() {
        let mut state = buffering_state();
        for fraction in state.pieces_mut().values_mut() {
            *fraction = 1.0;
        }

        assert!(state.observe().reached_full);
        assert!(!state.observe().reached_full);
        assert!(state.finish());
        assert!(state.is_finished());
        assert!(!state.has_pieces());
        assert!(!state.finish());
    }

    #[test]
    fn test_partial_pieces_never_read_complete() {
        let mut pieces: BTreeMap<u32, f64> = [(0, 0.0), (1, 0.0), (2, 0.0)].into_iter().collect();
        let queue = [
            PartialPiece {
                index: 1,
                bytes_downloaded: MIB,
                bytes_total: MIB,
            },
            PartialPiece {
                index: 2,
                bytes_downloaded: MIB / 2,
                bytes_total: MIB,
            },
        ];

        let completed = update_piece_progress(&mut pieces, |piece| piece == 0, &queue);

        assert_eq!(completed, vec![0]);
        assert_eq!(pieces[&0], 1.0);
        assert_eq!(pieces[&1], PARTIAL_PROGRESS_CAP);
        assert_eq!(pieces[&2], 0.5);
    }

    #[test]
    fn test_pieces_status_format() {
        let mut state = buffering_state();
        state.pieces_mut().insert(1, 0.5);
        assert_eq!(state.pieces_status(), "[0:0, 1:50, 99:0]");
    }
}
