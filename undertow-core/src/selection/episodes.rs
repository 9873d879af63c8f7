//! Season/episode filename matching.

use regex::Regex;

/// Matches `S01E02`, `s1.e2`, `S01 - E02` and `1x02` forms of an episode.
///
/// # Errors
///
/// - `regex::Error` - The pattern failed to compile
pub fn episode_pattern(season: u32, episode: u32) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?i)(?:^|[^0-9a-z])(?:s0*{season}[\s._-]*e0*{episode}|0*{season}x0*{episode})(?:[^0-9]|$)"
    ))
}

/// Matches a bare absolute episode number not embedded in a longer number.
///
/// # Errors
///
/// - `regex::Error` - The pattern failed to compile
pub fn absolute_pattern(number: u32) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"(?:^|[^0-9])0*{number}(?:[^0-9]|$)"))
}

/// Outcome of matching a pattern against candidate names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpisodeMatch {
    /// Position of the last matching name
    pub last: Option<usize>,
    pub count: usize,
}

impl EpisodeMatch {
    /// The matching position when exactly one name matched.
    pub fn unique(&self) -> Option<usize> {
        (self.count == 1).then_some(self.last).flatten()
    }
}

/// Counts names matching `pattern`.
pub fn match_names<'a>(pattern: &Regex, names: impl IntoIterator<Item = &'a str>) -> EpisodeMatch {
    let mut result = EpisodeMatch::default();
    for (position, name) in names.into_iter().enumerate() {
        if pattern.is_match(name) {
            result.last = Some(position);
            result.count += 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_forms() {
        let pattern = episode_pattern(1, 2).unwrap();

        assert!(pattern.is_match("Show.S01E02.mkv"));
        assert!(pattern.is_match("show s1e2 720p.mkv"));
        assert!(pattern.is_match("Show - S01 - E02.mkv"));
        assert!(pattern.is_match("Show 1x02.avi"));

        assert!(!pattern.is_match("Show.S01E01.mkv"));
        assert!(!pattern.is_match("Show.S01E12.mkv"));
        assert!(!pattern.is_match("Show.S01E20.mkv"));
        assert!(!pattern.is_match("Show.S11E02.mkv"));
    }

    #[test]
    fn test_unique_match() {
        let pattern = episode_pattern(1, 2).unwrap();
        let names = ["Show.S01E01.mkv", "Show.S01E02.mkv"];

        let matched = match_names(&pattern, names);
        assert_eq!(matched.unique(), Some(1));

        let doubled = match_names(&pattern, ["a.S01E02.mkv", "b.S01E02.mkv"]);
        assert_eq!(doubled.count, 2);
        assert_eq!(doubled.unique(), None);
    }

    #[test]
    fn test_absolute_number() {
        let pattern = absolute_pattern(105).unwrap();

        assert!(pattern.is_match("[Group] Show - 105 [1080p].mkv"));
        assert!(pattern.is_match("Show_0105.mkv"));
        assert!(!pattern.is_match("Show - 1050.mkv"));
        assert!(!pattern.is_match("Show - 2105.mkv"));
    }
}
