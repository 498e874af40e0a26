use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::download::progress::{ParseState, ProgressEvent, parse_line};
use crate::download::{Artifact, sort_by_ordinal};
use crate::error::{DownloadError, is_auth_error};

const AUDIO_QUALITY: &str = "192K";
const STDERR_TAIL_LINES: usize = 200;
const STDERR_REPORT_CHARS: usize = 500;
const STABILITY_POLLS: u32 = 6;
const STABILITY_INTERVAL: Duration = Duration::from_millis(500);

/// Wrapper around the yt-dlp binary. Each download runs as a child
/// process writing into a fresh temp directory; progress is streamed
/// from its stdout into the given channel.
pub struct YtDlp {
    bin: String,
}

impl YtDlp {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Fetch one URL as a single MP3. Playlist expansion is disabled even
    /// when the URL nominally supports it. Returns the artifact and the
    /// temp directory that owns it.
    pub async fn download_single(
        &self,
        url: &str,
        cookies: Option<&Path>,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<(Artifact, TempDir), DownloadError> {
        let dir = TempDir::with_prefix("ytmp_")?;
        let outtmpl = dir.path().join("%(title)s.%(ext)s");
        let args = single_args(&outtmpl, cookies);
        self.run(args, url, events).await?;

        let mut artifacts = scan_audio(dir.path());
        match artifacts.pop() {
            Some(artifact) => Ok((artifact, dir)),
            None => Err(DownloadError::FileMissing(dir.path().to_path_buf())),
        }
    }

    /// Fetch a playlist URL as ordinally prefixed MP3s. Unavailable items
    /// are skipped, not fatal; the output directory rescan is the source
    /// of truth for what was actually produced.
    pub async fn download_playlist(
        &self,
        url: &str,
        cookies: Option<&Path>,
        events: mpsc::Sender<ProgressEvent>,
        max_items: usize,
    ) -> Result<(Vec<Artifact>, TempDir), DownloadError> {
        let dir = TempDir::with_prefix("ytplaylist_")?;
        let outtmpl = dir.path().join("%(playlist_index)s - %(title)s.%(ext)s");
        let args = playlist_args(&outtmpl, cookies);

        let outcome = self.run(args, url, events).await;
        if scan_audio(dir.path()).is_empty() {
            // Nothing on disk; surface whatever the utility complained about.
            return match outcome {
                Err(e) => Err(e),
                Ok(()) => Err(DownloadError::Failed("no audio files were produced".into())),
            };
        }
        if let Err(e) = outcome {
            warn!("yt-dlp reported errors but files were produced, continuing: {e}");
        }

        let artifacts = collect_artifacts(dir.path(), max_items).await?;
        Ok((artifacts, dir))
    }

    async fn run(
        &self,
        mut args: Vec<String>,
        url: &str,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<(), DownloadError> {
        args.push(url.to_string());
        debug!("running {} {}", self.bin, args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DownloadError::Failed(format!("failed to spawn {}: {e}", self.bin)))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("yt-dlp stderr: {line}");
                    tail.push_back(line);
                    if tail.len() > STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                }
                tail.make_contiguous().join("\n")
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut state = ParseState::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parse_line(&line, &mut state) {
                    // A full channel drops the event; never stall the reader.
                    let _ = events.try_send(event);
                }
            }
        }

        let status = child.wait().await?;
        let stderr_text = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else if is_auth_error(&stderr_text) {
            Err(DownloadError::AuthRequired)
        } else {
            let total = stderr_text.chars().count();
            let tail: String = stderr_text
                .chars()
                .skip(total.saturating_sub(STDERR_REPORT_CHARS))
                .collect();
            Err(DownloadError::Failed(tail))
        }
    }
}

fn base_args(outtmpl: &Path, cookies: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--extract-audio",
        "--audio-format",
        "mp3",
        "--audio-quality",
        AUDIO_QUALITY,
        "--newline",
        "--no-warnings",
        "-o",
    ]
    .map(String::from)
    .to_vec();
    args.push(outtmpl.to_string_lossy().into_owned());
    if let Some(path) = cookies {
        args.push("--cookies".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
    args
}

fn single_args(outtmpl: &Path, cookies: Option<&Path>) -> Vec<String> {
    let mut args = base_args(outtmpl, cookies);
    args.extend(["--no-playlist", "--playlist-items", "1"].map(String::from));
    args
}

fn playlist_args(outtmpl: &Path, cookies: Option<&Path>) -> Vec<String> {
    let mut args = base_args(outtmpl, cookies);
    args.extend(["--yes-playlist", "--ignore-errors"].map(String::from));
    args
}

fn scan_audio(dir: &Path) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "mp3") {
                artifacts.push(Artifact::new(path));
            }
        }
    }
    artifacts
}

/// Rescan a playlist output directory: sort by ordinal prefix, enforce the
/// item cap, then keep only files whose size has stabilized. Zero-size
/// files are dropped.
async fn collect_artifacts(dir: &Path, max_items: usize) -> Result<Vec<Artifact>, DownloadError> {
    let mut artifacts = scan_audio(dir);
    sort_by_ordinal(&mut artifacts);

    if artifacts.len() > max_items {
        return Err(DownloadError::TooManyItems {
            count: artifacts.len(),
            limit: max_items,
        });
    }

    let mut stable = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        if wait_for_stable_size(&artifact.path).await {
            stable.push(artifact);
        } else {
            warn!("dropping {} - size never became positive", artifact.path.display());
        }
    }
    Ok(stable)
}

/// Poll a file's size until two consecutive reads agree on a positive
/// value, up to ~3 seconds. A file that never stabilizes is still accepted
/// if its size is positive by the end.
async fn wait_for_stable_size(path: &Path) -> bool {
    let mut last: i64 = -1;
    for _ in 0..STABILITY_POLLS {
        let current = size_of(path);
        if current > 0 && current == last {
            return true;
        }
        last = current;
        tokio::time::sleep(STABILITY_INTERVAL).await;
    }
    size_of(path) > 0
}

fn size_of(path: &Path) -> i64 {
    std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn single_args_disable_playlist_expansion() {
        let args = single_args(Path::new("/tmp/x/%(title)s.%(ext)s"), None);
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--playlist-items".to_string()));
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn playlist_args_skip_broken_items() {
        let args = playlist_args(Path::new("/tmp/x/%(playlist_index)s - %(title)s.%(ext)s"), None);
        assert!(args.contains(&"--yes-playlist".to_string()));
        assert!(args.contains(&"--ignore-errors".to_string()));
    }

    #[test]
    fn cookies_argument_is_appended_when_present() {
        let args = single_args(Path::new("/tmp/x/o.%(ext)s"), Some(Path::new("/tmp/c.txt")));
        let pos = args.iter().position(|a| a == "--cookies").unwrap();
        assert_eq!(args[pos + 1], "/tmp/c.txt");
    }

    #[test]
    fn audio_extraction_flags_are_always_set() {
        let args = base_args(Path::new("/tmp/o.%(ext)s"), None);
        assert!(args.contains(&"--extract-audio".to_string()));
        assert!(args.contains(&"--audio-format".to_string()));
        assert!(args.contains(&"--newline".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn collect_sorts_by_ordinal_prefix() {
        let dir = TempDir::new().unwrap();
        for name in ["2 - b.mp3", "10 - c.mp3", "1 - a.mp3"] {
            fs::write(dir.path().join(name), b"audio").unwrap();
        }
        let artifacts = collect_artifacts(dir.path(), 50).await.unwrap();
        let names: Vec<String> = artifacts.iter().map(|a| a.file_name()).collect();
        assert_eq!(names, vec!["1 - a.mp3", "2 - b.mp3", "10 - c.mp3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_fails_when_cap_exceeded() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            fs::write(dir.path().join(format!("{i} - t.mp3")), b"x").unwrap();
        }
        match collect_artifacts(dir.path(), 3).await {
            Err(DownloadError::TooManyItems { count, limit }) => {
                assert_eq!((count, limit), (4, 3));
            }
            other => panic!("expected TooManyItems, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collect_drops_empty_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1 - a.mp3"), b"audio").unwrap();
        fs::write(dir.path().join("2 - b.mp3"), b"").unwrap();
        let artifacts = collect_artifacts(dir.path(), 50).await.unwrap();
        let names: Vec<String> = artifacts.iter().map(|a| a.file_name()).collect();
        assert_eq!(names, vec!["1 - a.mp3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stable_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.mp3");
        fs::write(&path, b"constant size").unwrap();
        assert!(wait_for_stable_size(&path).await);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(!wait_for_stable_size(&dir.path().join("absent.mp3")).await);
    }

    #[test]
    fn scan_ignores_non_audio_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        fs::write(dir.path().join("a.part"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(scan_audio(dir.path()).len(), 1);
    }
}
