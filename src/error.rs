use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between receiving a URL and delivering
/// the resulting audio. All variants are caught at the delivery boundary
/// and turned into a status-message edit; none of them crash the bot.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    Failed(String),

    #[error("playlist produced {count} files, limit is {limit}")]
    TooManyItems { count: usize, limit: usize },

    #[error("the source requires sign-in cookies")]
    AuthRequired,

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("expected audio file is missing: {}", .0.display())]
    FileMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Substrings yt-dlp emits when a source demands authentication.
const AUTH_MARKERS: &[&str] = &[
    "sign in",
    "cookies",
    "login required",
    "private video",
    "members-only",
    "age-restricted",
];

/// Whether an error text from yt-dlp points at missing credentials
/// rather than a plain network or availability failure.
pub fn is_auth_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_in_marker_is_detected() {
        assert!(is_auth_error(
            "ERROR: [youtube] abc123: Sign in to confirm you're not a bot"
        ));
    }

    #[test]
    fn cookies_marker_is_detected() {
        assert!(is_auth_error(
            "ERROR: Use --cookies-from-browser or --cookies for the authentication"
        ));
    }

    #[test]
    fn plain_network_error_is_not_auth() {
        assert!(!is_auth_error("ERROR: unable to download video data: timed out"));
    }

    #[test]
    fn too_many_items_renders_counts() {
        let err = DownloadError::TooManyItems { count: 120, limit: 50 };
        assert_eq!(err.to_string(), "playlist produced 120 files, limit is 50");
    }
}
