//! Piece geometry: mapping byte regions onto inclusive piece ranges.

use std::ops::RangeInclusive;

/// Closed interval `[begin, end]` of piece indices.
///
/// A range whose `begin` exceeds `end` is empty; this happens for
/// zero-length files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PieceRange {
    pub begin: u32,
    pub end: u32,
}

impl PieceRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn is_empty(&self) -> bool {
        self.begin > self.end
    }

    /// Number of pieces covered by the range.
    pub fn len(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    pub fn contains(&self, piece: u32) -> bool {
        piece >= self.begin && piece <= self.end
    }

    pub fn iter(&self) -> RangeInclusive<u32> {
        self.begin..=self.end
    }
}

/// A buffer window: piece range plus piece-aligned byte offset and length.
///
/// `offset` is relative to the start of the owning file, `size` never runs
/// past the end of the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferWindow {
    pub pieces: PieceRange,
    pub offset: u64,
    pub size: u64,
}

/// Piece geometry of a torrent with metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_size: u64,
}

impl PieceLayout {
    pub fn new(piece_length: u64, piece_count: u32, total_size: u64) -> Self {
        Self {
            piece_length,
            piece_count,
            total_size,
        }
    }

    fn last_piece(&self) -> u64 {
        u64::from(self.piece_count.saturating_sub(1))
    }

    /// Returns the pieces touched by `size` bytes starting at absolute `offset`.
    pub fn byte_region_pieces(&self, offset: u64, size: u64) -> PieceRange {
        if self.piece_length == 0 || self.piece_count == 0 {
            return PieceRange::default();
        }

        let begin = (offset / self.piece_length).min(self.last_piece());
        let last_byte = offset.saturating_add(size).saturating_sub(1);
        let end = (last_byte / self.piece_length).min(self.last_piece());

        // Zero-length regions produce an empty range starting at `begin`.
        if size == 0 {
            return PieceRange::new(begin as u32 + 1, begin as u32);
        }

        PieceRange::new(begin as u32, end as u32)
    }

    /// Computes a buffer window of `length` bytes at `offset` inside the file
    /// that starts at absolute `file_offset`.
    ///
    /// The start is rounded down to a piece boundary and the end rounded up,
    /// both clamped to `[0, piece_count - 1]`. An end that lands before the
    /// start collapses onto the start piece.
    pub fn buffer_window(&self, file_offset: u64, offset: u64, length: u64) -> BufferWindow {
        if self.piece_length == 0 || self.piece_count == 0 {
            return BufferWindow::default();
        }

        let start = file_offset.saturating_add(offset);
        let start_piece = (start / self.piece_length).min(self.last_piece());

        let end = start.saturating_add(length);
        let end_piece = (end.saturating_sub(1) / self.piece_length)
            .min(self.last_piece())
            .max(start_piece);

        let aligned = start_piece * self.piece_length;
        let mut size = (end_piece - start_piece + 1) * self.piece_length;
        if self.total_size != 0 && aligned + size >= self.total_size {
            size = self.total_size.saturating_sub(aligned);
        }

        BufferWindow {
            pieces: PieceRange::new(start_piece as u32, end_piece as u32),
            offset: aligned.saturating_sub(file_offset),
            size,
        }
    }
}
