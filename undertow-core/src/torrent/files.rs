//! File table of a torrent with metadata.

use std::path::Path;

use super::layout::{PieceLayout, PieceRange};
use crate::engine::EngineFile;

/// One file inside a torrent.
///
/// Immutable once built from metadata. Selection state lives in the owning
/// session's chosen-file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub index: usize,
    /// Slash separated path inside the torrent
    pub path: String,
    /// Last path component
    pub name: String,
    pub size: u64,
    /// Absolute byte offset of the first byte within the torrent
    pub offset: u64,
    pub pieces: PieceRange,
}

impl TorrentFile {
    /// Absolute byte offset one past the last byte of this file.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Ordered collection of the files of one torrent.
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    files: Vec<TorrentFile>,
}

impl FileTable {
    /// Builds the table from the engine's file listing, deriving each
    /// file's piece range from the layout.
    pub fn from_engine(layout: &PieceLayout, entries: &[EngineFile]) -> Self {
        let files = entries
            .iter()
            .map(|entry| {
                let name = Path::new(&entry.path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| entry.path.clone());

                TorrentFile {
                    index: entry.index,
                    path: entry.path.clone(),
                    name,
                    size: entry.size,
                    offset: entry.offset,
                    pieces: layout.byte_region_pieces(entry.offset, entry.size),
                }
            })
            .collect();

        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TorrentFile> {
        self.files.iter()
    }

    pub fn as_slice(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn by_path(&self, path: &str) -> Option<&TorrentFile> {
        self.files.iter().find(|file| file.path == path)
    }

    pub fn by_index(&self, index: usize) -> Option<&TorrentFile> {
        self.files.iter().find(|file| file.index == index)
    }

    /// Largest file; the first one wins ties.
    pub fn biggest(&self) -> Option<&TorrentFile> {
        self.files
            .iter()
            .reduce(|best, file| if file.size > best.size { file } else { best })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn table() -> FileTable {
        let layout = PieceLayout::new(MIB, 12, 12 * MIB);
        FileTable::from_engine(
            &layout,
            &[
                EngineFile::new(0, "Movie/sample.mkv", 2 * MIB, 0),
                EngineFile::new(1, "Movie/movie.mkv", 9 * MIB, 2 * MIB),
                EngineFile::new(2, "Movie/movie.nfo", MIB / 2, 11 * MIB),
            ],
        )
    }

    #[test]
    fn test_piece_ranges_follow_offsets() {
        let files = table();

        assert_eq!(files.by_index(0).unwrap().pieces, PieceRange::new(0, 1));
        assert_eq!(files.by_index(1).unwrap().pieces, PieceRange::new(2, 10));
        assert_eq!(files.by_index(2).unwrap().pieces, PieceRange::new(11, 11));
    }

    #[test]
    fn test_lookups() {
        let files = table();

        assert_eq!(files.by_path("Movie/movie.nfo").unwrap().index, 2);
        assert_eq!(files.by_index(1).unwrap().name, "movie.mkv");
        assert!(files.by_path("missing").is_none());
        assert_eq!(files.biggest().unwrap().index, 1);
    }
}
