//! Lock-free piece bitmap.
//!
//! Used for the awaiting and demand sets, which handlers on different tasks
//! touch concurrently without taking the session's locks.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u32 = 64;

/// Fixed-capacity set of piece indices backed by atomic words.
///
/// Indices at or beyond the capacity are never members; inserting them is a
/// no-op.
#[derive(Debug)]
pub struct PieceSet {
    words: Box<[AtomicU64]>,
    capacity: u32,
}

impl PieceSet {
    /// Creates an empty set able to hold indices `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        let word_count = capacity.div_ceil(WORD_BITS) as usize;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn slot(&self, piece: u32) -> Option<(&AtomicU64, u64)> {
        if piece >= self.capacity {
            return None;
        }
        let word = &self.words[(piece / WORD_BITS) as usize];
        Some((word, 1u64 << (piece % WORD_BITS)))
    }

    /// Adds a piece, returning true if it was not already present.
    pub fn insert(&self, piece: u32) -> bool {
        match self.slot(piece) {
            Some((word, mask)) => word.fetch_or(mask, Ordering::AcqRel) & mask == 0,
            None => false,
        }
    }

    /// Removes a piece, returning true if it was present.
    pub fn remove(&self, piece: u32) -> bool {
        match self.slot(piece) {
            Some((word, mask)) => word.fetch_and(!mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    pub fn contains(&self, piece: u32) -> bool {
        match self.slot(piece) {
            Some((word, mask)) => word.load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words
            .iter()
            .all(|word| word.load(Ordering::Acquire) == 0)
    }

    pub fn len(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Snapshot of the members in ascending order.
    pub fn to_vec(&self) -> Vec<u32> {
        let mut pieces = Vec::new();
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                pieces.push(word_index as u32 * WORD_BITS + bit);
                bits &= bits - 1;
            }
        }
        pieces
    }
}
