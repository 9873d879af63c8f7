//! Host memory probing and memory-window sizing policy.

use parking_lot::Mutex;
use sysinfo::System;

/// Pieces a memory-backed session always gets at startup.
pub const MIN_MEMORY_PIECES: u64 = 10;

/// Piece counts tried, largest first, when growing the memory window.
const GROWTH_STEPS: [u64; 4] = [25, 20, 15, 10];

/// Host memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub total: u64,
    pub free: u64,
}

/// Source of host memory figures.
pub trait MemoryProbe: Send + Sync {
    fn memory_stats(&self) -> MemoryStats;
}

/// Memory probe backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn memory_stats(&self) -> MemoryStats {
        let mut system = self.system.lock();
        system.refresh_memory();
        MemoryStats {
            total: system.total_memory(),
            free: system.available_memory(),
        }
    }
}

/// Startup floor: a memory window smaller than ten pieces is raised to ten.
pub fn startup_floor(current: u64, piece_length: u64) -> Option<u64> {
    let floor = piece_length * MIN_MEMORY_PIECES;
    (current < floor).then_some(floor)
}

/// Largest step in 25, 20, 15, 10 pieces whose growth over `current` costs
/// less than half of `free`.
///
/// Stops at the first step that would shrink the window, and never grows
/// when free memory is unknown.
pub fn growth_target(current: u64, piece_length: u64, free: u64) -> Option<u64> {
    for pieces in GROWTH_STEPS {
        let candidate = pieces * piece_length;
        if candidate < current || free == 0 {
            return None;
        }
        if (candidate - current).saturating_mul(2) < free {
            return Some(candidate);
        }
    }
    None
}

/// Grows the window so both buffer windows fit plus one spare piece.
pub fn fit_buffer(current: u64, buffer_bytes: u64, piece_length: u64) -> Option<u64> {
    (buffer_bytes > current).then_some(buffer_bytes + piece_length)
}
