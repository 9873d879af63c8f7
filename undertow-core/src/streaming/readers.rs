//! Reader registry and readahead allocation.
//!
//! Every open read cursor on a torrent file owns a byte-range demand window:
//! its position plus an assigned readahead. The registry splits one readahead
//! budget between readers, favouring those that read recently.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use super::format_bytes;
use crate::torrent::{PieceLayout, PieceRange, TorrentFile};

/// Identifier of one open reader, unique within its session.
pub type ReaderId = u64;

/// Readers counted per activity class when splitting the budget.
const MAX_COUNTED_READERS: usize = 2;

/// Percentage of the budget idle readers get when active readers exist too.
const IDLE_SHARE_PERCENT: u64 = 33;

#[derive(Debug, Clone)]
struct ReaderEntry {
    file_index: usize,
    file_offset: u64,
    file_size: u64,
    last_piece: u32,
    position: u64,
    last_used: Instant,
    readahead: u64,
}

impl ReaderEntry {
    fn absolute_position(&self) -> u64 {
        self.file_offset + self.position
    }
}

/// Point-in-time view of one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub id: ReaderId,
    pub file_index: usize,
    /// Cursor relative to the start of the file
    pub position: u64,
    pub readahead: u64,
    pub active: bool,
}

/// Activity of one reader as seen by the allocator.
#[derive(Debug, Clone, Copy)]
pub struct ReaderActivity {
    pub id: ReaderId,
    pub active: bool,
    pub last_used: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: ReaderId,
    readers: BTreeMap<ReaderId, ReaderEntry>,
}

/// All open readers of one session.
#[derive(Debug)]
pub struct ReaderRegistry {
    idle_after: Duration,
    inner: Mutex<Registry>,
}

impl ReaderRegistry {
    /// Creates an empty registry; readers without reads for `idle_after`
    /// count as idle.
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Registers a reader on `file` positioned at `position` bytes into it.
    pub fn register(&self, file: &TorrentFile, position: u64) -> ReaderId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        inner.readers.insert(
            id,
            ReaderEntry {
                file_index: file.index,
                file_offset: file.offset,
                file_size: file.size,
                last_piece: file.pieces.end,
                position: position.min(file.size),
                last_used: Instant::now(),
                readahead: 0,
            },
        );
        id
    }

    /// Moves a reader's cursor and marks it as used. Returns false for
    /// unknown readers.
    pub fn seek(&self, id: ReaderId, position: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.readers.get_mut(&id) {
            Some(entry) => {
                entry.position = position.min(entry.file_size);
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Records a read of `len` bytes at the cursor, advancing it.
    pub fn record_read(&self, id: ReaderId, len: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.readers.get_mut(&id) {
            Some(entry) => {
                entry.position = entry.position.saturating_add(len).min(entry.file_size);
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: ReaderId) -> bool {
        self.inner.lock().readers.remove(&id).is_some()
    }

    /// Removes every reader, returning their ids.
    pub fn drain(&self) -> Vec<ReaderId> {
        let mut inner = self.inner.lock();
        let ids = inner.readers.keys().copied().collect();
        inner.readers.clear();
        ids
    }

    pub fn contains(&self, id: ReaderId) -> bool {
        self.inner.lock().readers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().readers.is_empty()
    }

    pub fn readahead(&self, id: ReaderId) -> Option<u64> {
        self.inner.lock().readers.get(&id).map(|entry| entry.readahead)
    }

    /// Aggregate readahead of all readers.
    pub fn readahead_sum(&self) -> u64 {
        self.inner
            .lock()
            .readers
            .values()
            .map(|entry| entry.readahead)
            .sum()
    }

    pub fn snapshot(&self) -> Vec<ReaderInfo> {
        let inner = self.inner.lock();
        inner
            .readers
            .iter()
            .map(|(id, entry)| ReaderInfo {
                id: *id,
                file_index: entry.file_index,
                position: entry.position,
                readahead: entry.readahead,
                active: entry.last_used.elapsed() < self.idle_after,
            })
            .collect()
    }

    /// Piece demand of every reader: from its cursor to cursor plus
    /// readahead, never past the last piece of its file.
    pub fn demand_ranges(&self, layout: &PieceLayout) -> Vec<PieceRange> {
        let inner = self.inner.lock();
        inner
            .readers
            .values()
            .map(|entry| {
                let range =
                    layout.byte_region_pieces(entry.absolute_position(), entry.readahead.max(1));
                PieceRange::new(range.begin, range.end.min(entry.last_piece))
            })
            .collect()
    }

    /// Reclassifies readers and redistributes `budget` between them.
    ///
    /// Only readers whose readahead actually changes are updated; their new
    /// values are returned.
    pub fn reset(&self, budget: u64) -> Vec<(ReaderId, u64)> {
        let mut inner = self.inner.lock();
        if inner.readers.is_empty() {
            return Vec::new();
        }

        let activity: Vec<ReaderActivity> = inner
            .readers
            .iter()
            .map(|(id, entry)| ReaderActivity {
                id: *id,
                active: entry.last_used.elapsed() < self.idle_after,
                last_used: entry.last_used,
            })
            .collect();

        let mut changed = Vec::new();
        for (id, size) in allocate_readahead(budget, &activity) {
            let Some(entry) = inner.readers.get_mut(&id) else {
                continue;
            };
            if entry.readahead == size {
                continue;
            }

            info!(
                "Setting readahead for reader {} as {}",
                id,
                format_bytes(size)
            );
            entry.readahead = size;
            changed.push((id, size));
        }
        changed
    }
}

/// Splits `budget` between readers.
///
/// With both classes present idle readers share 33% and active readers the
/// rest; a single class takes the whole budget. Within a class the budget is
/// divided by the reader count capped at two: the most recently used reader
/// gets its own slice and any further readers share the last one, so the sum
/// never exceeds the budget.
pub fn allocate_readahead(budget: u64, readers: &[ReaderActivity]) -> Vec<(ReaderId, u64)> {
    let (active, idle): (Vec<_>, Vec<_>) = readers.iter().copied().partition(|r| r.active);

    let (active_budget, idle_budget) = match (active.is_empty(), idle.is_empty()) {
        (false, false) => {
            let idle_budget = budget * IDLE_SHARE_PERCENT / 100;
            (budget - idle_budget, idle_budget)
        }
        (false, true) => (budget, 0),
        (true, false) => (0, budget),
        (true, true) => return Vec::new(),
    };

    let mut allocation = Vec::with_capacity(readers.len());
    split_class(active_budget, active, &mut allocation);
    split_class(idle_budget, idle, &mut allocation);
    allocation
}

fn split_class(budget: u64, mut members: Vec<ReaderActivity>, out: &mut Vec<(ReaderId, u64)>) {
    if members.is_empty() {
        return;
    }

    members.sort_by(|a, b| b.last_used.cmp(&a.last_used).then(a.id.cmp(&b.id)));

    let counted = members.len().min(MAX_COUNTED_READERS);
    let slice = budget / counted as u64;
    let dedicated = counted - 1;

    for member in &members[..dedicated] {
        out.push((member.id, slice));
    }

    let sharing = &members[dedicated..];
    let shared = (budget - slice * dedicated as u64) / sharing.len() as u64;
    for member in sharing {
        out.push((member.id, shared));
    }
}
