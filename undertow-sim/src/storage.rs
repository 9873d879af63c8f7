//! Bounded in-memory piece window of a simulated torrent.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;
use undertow_core::MemoryStorage;
use undertow_core::streaming::{MemoryProbe, MemoryStats};

/// Keeps at most `memory_size / piece_length` completed pieces resident.
///
/// When a newly completed piece overflows the window the oldest resident
/// piece that no reader depends on and that is not reserved is evicted.
pub struct SimMemoryStorage {
    piece_length: u64,
    memory_size: AtomicU64,
    reader_pieces: Mutex<BTreeSet<u32>>,
    reserved_pieces: Mutex<BTreeSet<u32>>,
    resident: Mutex<VecDeque<u32>>,
}

impl SimMemoryStorage {
    pub fn new(memory_size: u64, piece_length: u64) -> Self {
        Self {
            piece_length: piece_length.max(1),
            memory_size: AtomicU64::new(memory_size),
            reader_pieces: Mutex::new(BTreeSet::new()),
            reserved_pieces: Mutex::new(BTreeSet::new()),
            resident: Mutex::new(VecDeque::new()),
        }
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size.load(Ordering::Relaxed)
    }

    /// Number of pieces the window holds, never less than one.
    pub fn capacity(&self) -> usize {
        ((self.memory_size() / self.piece_length) as usize).max(1)
    }

    pub fn reader_pieces(&self) -> Vec<u32> {
        self.reader_pieces.lock().iter().copied().collect()
    }

    pub fn reserved_pieces(&self) -> Vec<u32> {
        self.reserved_pieces.lock().iter().copied().collect()
    }

    pub fn resident(&self) -> Vec<u32> {
        self.resident.lock().iter().copied().collect()
    }

    /// Stores newly completed pieces and returns the pieces evicted to make
    /// room for them.
    pub fn admit(&self, completed: &[u32]) -> Vec<u32> {
        let mut resident = self.resident.lock();
        resident.extend(completed.iter().copied());
        self.evict_overflow(&mut resident)
    }

    fn evict_overflow(&self, resident: &mut VecDeque<u32>) -> Vec<u32> {
        let capacity = self.capacity();
        let readers = self.reader_pieces.lock();
        let reserved = self.reserved_pieces.lock();

        let mut evicted = Vec::new();
        while resident.len() > capacity {
            let Some(position) = resident
                .iter()
                .position(|piece| !readers.contains(piece) && !reserved.contains(piece))
            else {
                break;
            };
            if let Some(piece) = resident.remove(position) {
                trace!("Evicting piece {piece} from memory storage");
                evicted.push(piece);
            }
        }
        evicted
    }

    /// Shrinks the window after a size change, returning evicted pieces.
    pub fn enforce_capacity(&self) -> Vec<u32> {
        let mut resident = self.resident.lock();
        self.evict_overflow(&mut resident)
    }
}

impl MemoryStorage for SimMemoryStorage {
    fn set_memory_size(&self, bytes: u64) {
        self.memory_size.store(bytes, Ordering::Relaxed);
    }

    fn set_reader_pieces(&self, pieces: &[u32]) {
        *self.reader_pieces.lock() = pieces.iter().copied().collect();
    }

    fn set_reserved_pieces(&self, pieces: &[u32]) {
        *self.reserved_pieces.lock() = pieces.iter().copied().collect();
    }
}

/// Host memory figures that never change, for reproducible runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe {
    stats: MemoryStats,
}

impl FixedMemoryProbe {
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            stats: MemoryStats { total, free },
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn memory_stats(&self) -> MemoryStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_piece_is_evicted() {
        let storage = SimMemoryStorage::new(3 * 1024, 1024);

        assert!(storage.admit(&[0, 1, 2]).is_empty());
        assert_eq!(storage.admit(&[3]), vec![0]);
        assert_eq!(storage.resident(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reader_and_reserved_pieces_survive() {
        let storage = SimMemoryStorage::new(2 * 1024, 1024);
        storage.set_reader_pieces(&[0]);
        storage.set_reserved_pieces(&[1]);

        assert_eq!(storage.admit(&[0, 1, 2, 3]), vec![2, 3]);
        assert_eq!(storage.resident(), vec![0, 1]);
    }

    #[test]
    fn test_shrinking_window_evicts() {
        let storage = SimMemoryStorage::new(4 * 1024, 1024);
        storage.admit(&[5, 6, 7, 8]);

        storage.set_memory_size(2 * 1024);
        assert_eq!(storage.enforce_capacity(), vec![5, 6]);
        assert_eq!(storage.capacity(), 2);
    }
}
