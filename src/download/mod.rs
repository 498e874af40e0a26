use std::path::{Path, PathBuf};
use url::Url;

pub mod progress;
pub mod ytdlp;

/// How a requested URL should be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Single,
    Playlist,
}

/// A completed local audio file, plus its playlist position when known.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub ordinal: Option<u32>,
}

impl Artifact {
    pub fn new(path: PathBuf) -> Self {
        let ordinal = ordinal_of(&path);
        Self { path, ordinal }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Classify a URL as playlist or single item.
///
/// A URL is a playlist when it carries a `list` query parameter without a
/// `v` parameter, or when its path contains a `playlist` segment. This
/// mirrors what yt-dlp itself treats as playlist-only; URLs that fail to
/// parse fall back to single.
pub fn classify(url: &str) -> UrlKind {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return UrlKind::Single;
    };
    let has_list = parsed.query_pairs().any(|(k, _)| k == "list");
    let has_v = parsed.query_pairs().any(|(k, _)| k == "v");
    let playlist_path = parsed.path().contains("playlist");
    if (has_list && !has_v) || playlist_path {
        UrlKind::Playlist
    } else {
        UrlKind::Single
    }
}

/// Numeric ordinal prefix from a playlist filename ("12 - Title.mp3" -> 12).
pub fn ordinal_of(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    name.split(" - ").next()?.trim().parse().ok()
}

/// Sort artifacts ascending by ordinal prefix; files without a parseable
/// prefix sort last.
pub fn sort_by_ordinal(artifacts: &mut [Artifact]) {
    artifacts.sort_by_key(|a| a.ordinal.unwrap_or(u32::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_is_single() {
        assert_eq!(classify("https://youtube.com/watch?v=abc123"), UrlKind::Single);
    }

    #[test]
    fn playlist_path_is_playlist() {
        assert_eq!(
            classify("https://youtube.com/playlist?list=XYZ"),
            UrlKind::Playlist
        );
    }

    #[test]
    fn list_param_without_v_is_playlist() {
        assert_eq!(
            classify("https://youtube.com/something?list=PL123"),
            UrlKind::Playlist
        );
    }

    #[test]
    fn list_param_with_v_is_single() {
        assert_eq!(
            classify("https://youtube.com/watch?v=abc&list=PL123"),
            UrlKind::Single
        );
    }

    #[test]
    fn unparseable_url_is_single() {
        assert_eq!(classify("not a url"), UrlKind::Single);
    }

    #[test]
    fn ordinal_parsed_from_prefix() {
        assert_eq!(ordinal_of(Path::new("/tmp/3 - Song.mp3")), Some(3));
        assert_eq!(ordinal_of(Path::new("/tmp/12 - A - B.mp3")), Some(12));
        assert_eq!(ordinal_of(Path::new("/tmp/Song.mp3")), None);
    }

    #[test]
    fn sort_puts_unparseable_last() {
        let mut artifacts = vec![
            Artifact::new(PathBuf::from("/t/NA - x.mp3")),
            Artifact::new(PathBuf::from("/t/2 - b.mp3")),
            Artifact::new(PathBuf::from("/t/10 - c.mp3")),
            Artifact::new(PathBuf::from("/t/1 - a.mp3")),
        ];
        sort_by_ordinal(&mut artifacts);
        let names: Vec<String> = artifacts.iter().map(|a| a.file_name()).collect();
        assert_eq!(names, vec!["1 - a.mp3", "2 - b.mp3", "10 - c.mp3", "NA - x.mp3"]);
    }
}
