//! Streaming scheduler: buffering, readers and piece priorities.
//!
//! A [`TorrentSession`] holds the per-torrent state; its watch loop drives
//! buffering progress and priority reconciliation on fixed ticks.

pub mod buffer;
pub mod memory;
pub mod readers;
pub mod scheduler;
pub mod session;
pub mod watch;

pub use buffer::{BufferPhase, BufferState, BufferWindows};
pub use memory::{MemoryProbe, MemoryStats, SystemMemoryProbe};
pub use readers::{ReaderId, ReaderInfo, ReaderRegistry};
pub use scheduler::{Fingerprint, PriorityPlan};
pub use session::{
    ArtifactPaths, Connections, MetadataWait, PlaybackPosition, ReaderHandle, SessionContext,
    SessionStatus, TorrentSession,
};
pub use watch::{SessionOwner, WatchCommand, spawn_watch};

/// Formats a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes, &["B", "KB", "MB", "GB", "TB"])
}

/// Formats a transfer rate with binary units.
pub fn format_bytes_per_second(bytes_per_second: u64) -> String {
    scaled(bytes_per_second, &["B/s", "KB/s", "MB/s", "GB/s"])
}

fn scaled(amount: u64, units: &[&str]) -> String {
    if amount == 0 {
        return format!("0 {}", units[0]);
    }

    let mut value = amount as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < units.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if value >= 10.0 {
        format!("{:.0} {}", value, units[unit_index])
    } else {
        format!("{:.1} {}", value, units[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20 MB");
    }

    #[test]
    fn test_format_rates() {
        assert_eq!(format_bytes_per_second(0), "0 B/s");
        assert_eq!(format_bytes_per_second(2048), "2.0 KB/s");
        assert_eq!(format_bytes_per_second(5 * 1024 * 1024 * 1024 * 1024), "5120 GB/s");
    }
}
