//! Candidate file detection and final file choice.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::collaborators::{MatchHistory, SelectionPrompt, ShowMetadata};
use super::episodes::{absolute_pattern, episode_pattern, match_names};
use super::{MediaHint, SelectionError};
use crate::config::SelectionConfig;
use crate::streaming::format_bytes;
use crate::torrent::TorrentFile;

/// Directory markers of disc-image layouts.
pub const DISC_MARKERS: [&str; 2] = ["BDMV/STREAM/", "VIDEO_TS/"];

/// A playable file offered for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    /// Engine index of the file
    pub index: usize,
    pub file_name: String,
    pub display_name: String,
    pub path: String,
    pub size: u64,
}

/// Result of candidate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    pub candidates: Vec<CandidateFile>,
    /// Engine index of the largest file
    pub biggest: usize,
    pub disc_image: bool,
}

/// The file chosen for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub file: TorrentFile,
    /// Position in the candidate list, `None` when chosen outside of it
    pub position: Option<usize>,
}

/// Title directory of a file inside a disc-image layout.
pub fn disc_title(path: &str) -> Option<&str> {
    DISC_MARKERS.iter().find_map(|marker| {
        let start = path.find(marker)?;
        Some(path[..start].trim_end_matches('/'))
    })
}

pub fn is_archive(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("rar"))
}

/// Strips the directory prefix shared by all display names.
pub fn trim_display_names(candidates: &mut [CandidateFile]) {
    if candidates.len() < 2 {
        return;
    }

    let first = candidates[0].display_name.clone();
    let mut shared = first.len();
    for candidate in &candidates[1..] {
        shared = first
            .char_indices()
            .zip(candidate.display_name.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((offset, c), _)| offset + c.len_utf8())
            .min(shared);
    }

    let Some(cut) = first[..shared].rfind('/').map(|slash| slash + 1) else {
        return;
    };
    if candidates.iter().any(|c| c.display_name.len() <= cut) {
        return;
    }
    for candidate in candidates.iter_mut() {
        candidate.display_name = candidate.display_name[cut..].to_string();
    }
}

/// Appends ` [size]` to each display name.
pub fn append_size_suffixes(candidates: &mut [CandidateFile]) {
    for candidate in candidates.iter_mut() {
        candidate.display_name = format!(
            "{} [{}]",
            candidate.display_name,
            format_bytes(candidate.size)
        );
    }
}

/// Picks the file to play from a torrent's file table.
pub struct FileSelector {
    config: SelectionConfig,
    metadata: Arc<dyn ShowMetadata>,
    prompt: Arc<dyn SelectionPrompt>,
    history: Arc<dyn MatchHistory>,
}

impl FileSelector {
    pub fn new(
        config: SelectionConfig,
        metadata: Arc<dyn ShowMetadata>,
        prompt: Arc<dyn SelectionPrompt>,
        history: Arc<dyn MatchHistory>,
    ) -> Self {
        Self {
            config,
            metadata,
            prompt,
            history,
        }
    }

    /// Size a file must reach to be a candidate.
    ///
    /// For shows it is the per-minute size times the shortest known episode
    /// runtime, capped at the default runtime.
    pub async fn min_candidate_size(&self, hint: Option<&MediaHint>) -> u64 {
        let Some(show_id) = hint.and_then(|hint| hint.show_id) else {
            return self.config.min_candidate_size;
        };
        let Some(runtimes) = self.metadata.episode_runtimes(show_id).await else {
            return self.config.min_candidate_size;
        };

        let runtime = runtimes
            .into_iter()
            .filter(|runtime| *runtime > 0)
            .chain(std::iter::once(self.config.default_episode_runtime))
            .min()
            .unwrap_or(self.config.default_episode_runtime);
        self.config.min_candidate_show_size * u64::from(runtime)
    }

    /// Playable candidates of `files` plus the largest file as fallback.
    ///
    /// # Errors
    ///
    /// - `SelectionError::NotFound` - The torrent has no files
    /// - `SelectionError::ArchiveDeclined` - An archive needs confirmation and
    ///   the user declined
    pub async fn select_candidates(
        &self,
        files: &[TorrentFile],
        hint: Option<&MediaHint>,
    ) -> Result<CandidateSet, SelectionError> {
        let biggest = files
            .iter()
            .reduce(|best, file| if file.size > best.size { file } else { best })
            .ok_or(SelectionError::NotFound)?
            .index;

        let min_size = self.min_candidate_size(hint).await;
        let mut eligible = Vec::new();
        let mut disc_image = false;

        for file in files {
            if file.size >= min_size {
                eligible.push(file);
            }
            if disc_title(&file.path).is_some() {
                disc_image = true;
                continue;
            }
            if is_archive(&file.path) && file.size > self.config.archive_size_threshold {
                info!("Archive detected: {}", file.path);
                if !self.prompt.confirm_archive(&file.path).await {
                    return Err(SelectionError::ArchiveDeclined {
                        path: file.path.clone(),
                    });
                }
            }
        }

        let mut candidates = if disc_image {
            let mut titles: BTreeMap<&str, &TorrentFile> = BTreeMap::new();
            for file in files {
                let Some(title) = disc_title(&file.path) else {
                    continue;
                };
                let entry = titles.entry(title).or_insert(file);
                if file.size > entry.size {
                    *entry = file;
                }
            }

            titles
                .into_iter()
                .map(|(title, file)| CandidateFile {
                    index: file.index,
                    file_name: title.to_string(),
                    display_name: title.to_string(),
                    path: title.to_string(),
                    size: file.size,
                })
                .collect()
        } else {
            eligible
                .into_iter()
                .map(|file| CandidateFile {
                    index: file.index,
                    file_name: file.name.clone(),
                    display_name: file.path.clone(),
                    path: file.path.clone(),
                    size: file.size,
                })
                .collect::<Vec<_>>()
        };

        info!(
            "There are {} candidate files (threshold {})",
            candidates.len(),
            format_bytes(min_size)
        );
        trim_display_names(&mut candidates);

        Ok(CandidateSet {
            candidates,
            biggest,
            disc_image,
        })
    }

    /// Chooses the file to play.
    ///
    /// An explicit engine index wins. Otherwise a single candidate is used
    /// directly; several candidates are narrowed by episode number, then by
    /// absolute number, then by an explicit candidate position, and finally
    /// by asking the user. Without candidates the largest file is used.
    ///
    /// # Errors
    ///
    /// - `SelectionError::UserCancelled` - The user dismissed the choice
    /// - Any error of [`FileSelector::select_candidates`]
    pub async fn choose(
        &self,
        files: &[TorrentFile],
        hint: Option<&MediaHint>,
    ) -> Result<Selection, SelectionError> {
        if let Some(index) = hint.and_then(|hint| hint.original_index) {
            if let Some(file) = files.iter().find(|file| file.index == index) {
                return Ok(Selection {
                    file: file.clone(),
                    position: None,
                });
            }
        }

        let set = self.select_candidates(files, hint).await?;
        let mut candidates = set.candidates;

        let pick = |position: usize, candidates: &[CandidateFile]| -> Result<Selection, SelectionError> {
            let index = candidates
                .get(position)
                .map(|candidate| candidate.index)
                .ok_or(SelectionError::NotFound)?;
            let file = file_by_index(files, index)?;
            Ok(Selection {
                file,
                position: Some(position),
            })
        };

        match candidates.len() {
            0 => {
                return Ok(Selection {
                    file: file_by_index(files, set.biggest)?,
                    position: None,
                });
            }
            1 => return pick(0, &candidates),
            _ => {}
        }

        if !hint.is_some_and(MediaHint::is_episode) {
            append_size_suffixes(&mut candidates);
        }

        let mut absolute_number = hint.and_then(|hint| hint.absolute_number);

        if let Some(hint) = hint.filter(|hint| hint.file_index.is_none()) {
            if let Some((season, episode)) = hint.episode_number() {
                let history = Arc::clone(&self.history);
                let recorded_hint = hint.clone();
                let recorded = candidates.clone();
                tokio::spawn(async move { history.record(&recorded_hint, &recorded).await });

                let pattern = episode_pattern(season, episode)?;
                let matched = match_names(&pattern, candidates.iter().map(|c| c.path.as_str()));
                if let Some(position) = matched.unique() {
                    debug!("Matched S{season}E{episode} to {}", candidates[position].path);
                    return pick(position, &candidates);
                }

                if let Some(show_id) = hint.show_id {
                    if let Some(number) = self
                        .metadata
                        .absolute_episode_number(show_id, season, episode)
                        .await
                        .filter(|number| *number > 0)
                    {
                        absolute_number = Some(number);
                        let pattern = absolute_pattern(number)?;
                        let matched =
                            match_names(&pattern, candidates.iter().map(|c| c.file_name.as_str()));
                        if let Some(position) = matched.unique() {
                            debug!("Matched absolute episode {number} to {}", candidates[position].path);
                            return pick(position, &candidates);
                        }
                    }
                }
            }
        }

        if let Some(position) = hint
            .and_then(|hint| hint.file_index)
            .filter(|position| *position < candidates.len())
        {
            return pick(position, &candidates);
        }

        let title = search_title(hint, absolute_number);
        let items: Vec<String> = candidates.iter().map(|c| c.display_name.clone()).collect();
        match self.prompt.choose(&title, &items).await {
            Some(position) if position < candidates.len() => pick(position, &candidates),
            _ => Err(SelectionError::UserCancelled),
        }
    }
}

fn file_by_index(files: &[TorrentFile], index: usize) -> Result<TorrentFile, SelectionError> {
    files
        .iter()
        .find(|file| file.index == index)
        .cloned()
        .ok_or(SelectionError::NotFound)
}

fn search_title(hint: Option<&MediaHint>, absolute_number: Option<u32>) -> String {
    let Some(hint) = hint else {
        return String::new();
    };

    let mut parts = Vec::new();
    if let Some(number) = absolute_number.filter(|number| *number > 0) {
        parts.push(format!("E{number}"));
    }
    if let Some((season, episode)) = hint.episode_number() {
        parts.push(format!("S{season}E{episode}"));
    } else if let Some(title) = &hint.title {
        parts.push(title.clone());
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::selection::collaborators::{DecliningPrompt, NoHistory, NoShowMetadata};
    use crate::torrent::PieceRange;

    const MIB: u64 = 1024 * 1024;

    fn file(index: usize, path: &str, size: u64) -> TorrentFile {
        TorrentFile {
            index,
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size,
            offset: 0,
            pieces: PieceRange::new(0, 0),
        }
    }

    fn config() -> SelectionConfig {
        SelectionConfig {
            min_candidate_size: 10 * MIB,
            min_candidate_show_size: 2 * MIB,
            archive_size_threshold: 10 * MIB,
            default_episode_runtime: 30,
        }
    }

    fn selector() -> FileSelector {
        FileSelector::new(
            config(),
            Arc::new(NoShowMetadata),
            Arc::new(DecliningPrompt),
            Arc::new(NoHistory),
        )
    }

    #[derive(Default)]
    struct ScriptedPrompt {
        confirm: bool,
        choice: Option<usize>,
        asked: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl SelectionPrompt for ScriptedPrompt {
        async fn confirm_archive(&self, _path: &str) -> bool {
            self.confirm
        }

        async fn choose(&self, title: &str, items: &[String]) -> Option<usize> {
            self.asked.lock().push((title.to_string(), items.to_vec()));
            self.choice
        }
    }

    struct Anime;

    #[async_trait]
    impl ShowMetadata for Anime {
        async fn episode_runtimes(&self, _show_id: u64) -> Option<Vec<u32>> {
            Some(vec![24, 48])
        }

        async fn absolute_episode_number(
            &self,
            _show_id: u64,
            _season: u32,
            episode: u32,
        ) -> Option<u32> {
            Some(100 + episode)
        }
    }

    #[tokio::test]
    async fn test_size_threshold_picks_single_candidate() {
        let files = [
            file(0, "A.mkv", 5 * MIB),
            file(1, "B.mkv", 500 * MIB),
            file(2, "C.mkv", 2 * MIB),
        ];

        let set = selector().select_candidates(&files, None).await.unwrap();
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].index, 1);
        assert_eq!(set.biggest, 1);

        let selection = selector().choose(&files, None).await.unwrap();
        assert_eq!(selection.file.path, "B.mkv");
    }

    #[tokio::test]
    async fn test_disc_image_groups_by_title() {
        let files = [
            file(0, "TITLE1/BDMV/STREAM/00000.m2ts", 800 * MIB),
            file(1, "TITLE1/BDMV/STREAM/00001.m2ts", 50 * MIB),
            file(2, "TITLE1/BDMV/index.bdmv", 1024),
        ];

        let set = selector().select_candidates(&files, None).await.unwrap();
        assert!(set.disc_image);
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].display_name, "TITLE1");
        assert_eq!(set.candidates[0].index, 0);
    }

    #[tokio::test]
    async fn test_archive_requires_confirmation() {
        let files = [file(0, "Movie/movie.part1.RAR", 400 * MIB)];

        let err = selector().select_candidates(&files, None).await.unwrap_err();
        assert!(matches!(err, SelectionError::ArchiveDeclined { .. }));

        let confirming = FileSelector::new(
            config(),
            Arc::new(NoShowMetadata),
            Arc::new(ScriptedPrompt {
                confirm: true,
                ..ScriptedPrompt::default()
            }),
            Arc::new(NoHistory),
        );
        let set = confirming.select_candidates(&files, None).await.unwrap();
        assert_eq!(set.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_episode_match_picks_exact_file() {
        let files = [
            file(0, "Show/Show.S01E01.mkv", 300 * MIB),
            file(1, "Show/Show.S01E02.mkv", 300 * MIB),
        ];
        let hint = MediaHint {
            season: Some(1),
            episode: Some(2),
            ..MediaHint::default()
        };

        let selection = selector().choose(&files, Some(&hint)).await.unwrap();
        assert_eq!(selection.file.index, 1);
        assert_eq!(selection.position, Some(1));
    }

    #[tokio::test]
    async fn test_absolute_number_fallback() {
        let files = [
            file(0, "[Group] Show - 101.mkv", 300 * MIB),
            file(1, "[Group] Show - 102.mkv", 300 * MIB),
        ];
        let hint = MediaHint {
            show_id: Some(7),
            season: Some(3),
            episode: Some(2),
            ..MediaHint::default()
        };
        let selector = FileSelector::new(
            config(),
            Arc::new(Anime),
            Arc::new(DecliningPrompt),
            Arc::new(NoHistory),
        );

        let selection = selector.choose(&files, Some(&hint)).await.unwrap();
        assert_eq!(selection.file.index, 1);
    }

    #[tokio::test]
    async fn test_show_threshold_scales_with_runtime() {
        let selector = FileSelector::new(
            config(),
            Arc::new(Anime),
            Arc::new(DecliningPrompt),
            Arc::new(NoHistory),
        );
        let hint = MediaHint {
            show_id: Some(7),
            ..MediaHint::default()
        };

        assert_eq!(selector.min_candidate_size(Some(&hint)).await, 48 * MIB);
        assert_eq!(selector.min_candidate_size(None).await, 10 * MIB);
    }

    #[tokio::test]
    async fn test_prompt_receives_trimmed_names_with_sizes() {
        let files = [
            file(0, "Pack/Movie One.mkv", 700 * MIB),
            file(1, "Pack/Movie Two.mkv", 1400 * MIB),
        ];
        let prompt = Arc::new(ScriptedPrompt {
            choice: Some(1),
            ..ScriptedPrompt::default()
        });
        let selector = FileSelector::new(
            config(),
            Arc::new(NoShowMetadata),
            prompt.clone(),
            Arc::new(NoHistory),
        );
        let hint = MediaHint {
            title: Some("Movies".to_string()),
            ..MediaHint::default()
        };

        let selection = selector.choose(&files, Some(&hint)).await.unwrap();
        assert_eq!(selection.file.index, 1);

        let asked = prompt.asked.lock();
        assert_eq!(asked[0].0, "Movies");
        assert_eq!(asked[0].1, vec!["Movie One.mkv [700 MB]", "Movie Two.mkv [1.4 GB]"]);
    }

    #[tokio::test]
    async fn test_cancelled_prompt() {
        let files = [file(0, "a.mkv", 700 * MIB), file(1, "b.mkv", 700 * MIB)];
        let err = selector().choose(&files, None).await.unwrap_err();
        assert!(matches!(err, SelectionError::UserCancelled));
    }

    #[tokio::test]
    async fn test_explicit_indexes() {
        let files = [file(0, "a.mkv", 700 * MIB), file(5, "b.mkv", 700 * MIB)];

        let original = MediaHint {
            original_index: Some(5),
            ..MediaHint::default()
        };
        let selection = selector().choose(&files, Some(&original)).await.unwrap();
        assert_eq!(selection.file.index, 5);
        assert_eq!(selection.position, None);

        let positional = MediaHint {
            file_index: Some(0),
            ..MediaHint::default()
        };
        let selection = selector().choose(&files, Some(&positional)).await.unwrap();
        assert_eq!(selection.file.index, 0);
    }

    #[tokio::test]
    async fn test_no_candidates_falls_back_to_biggest() {
        let files = [file(0, "a.nfo", 1024), file(1, "sample.mkv", 4 * MIB)];
        let selection = selector().choose(&files, None).await.unwrap();
        assert_eq!(selection.file.index, 1);
        assert_eq!(selection.position, None);

        let err = selector().choose(&[], None).await.unwrap_err();
        assert!(matches!(err, SelectionError::NotFound));
    }

    #[test]
    fn test_trim_keeps_file_names_whole() {
        let mut candidates: Vec<CandidateFile> = ["Show/Season 1/Ep 1.mkv", "Show/Season 1/Ep 2.mkv"]
            .iter()
            .enumerate()
            .map(|(index, path)| CandidateFile {
                index,
                file_name: String::new(),
                display_name: path.to_string(),
                path: path.to_string(),
                size: 0,
            })
            .collect();

        trim_display_names(&mut candidates);
        assert_eq!(candidates[0].display_name, "Ep 1.mkv");
        assert_eq!(candidates[1].display_name, "Ep 2.mkv");
    }

    #[test]
    fn test_disc_title() {
        assert_eq!(disc_title("A/BDMV/STREAM/1.m2ts"), Some("A"));
        assert_eq!(disc_title("B/VIDEO_TS/VTS_01_1.VOB"), Some("B"));
        assert_eq!(disc_title("C/movie.mkv"), None);
    }
}
