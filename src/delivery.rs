use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cookies::CookieStore;
use crate::download::progress::ProgressReporter;
use crate::download::ytdlp::YtDlp;
use crate::download::{Artifact, UrlKind, classify};
use crate::error::DownloadError;

/// Pause between playlist uploads so the Bot API rate limit is respected.
const INTER_ITEM_DELAY: Duration = Duration::from_millis(500);

const AUTH_GUIDANCE: &str = "This source requires sign-in cookies.\n\
    Use /setcookies to upload a cookies.txt file, or /setcookies_paste \
    to paste its contents, then try the download again.";

/// Run one download-and-deliver sequence to completion. Every outcome,
/// success or failure, ends with a readable status in the chat, and the
/// temp directory backing the artifacts is removed exactly once when it
/// drops at the end of this function.
pub async fn deliver(bot: Bot, chat: ChatId, url: String, config: Arc<Config>, cookies: Arc<CookieStore>) {
    let status = match bot.send_message(chat, "Preparing download...").await {
        Ok(message) => message,
        Err(e) => {
            warn!("chat {chat}: could not open a status message: {e}");
            return;
        }
    };

    let kind = classify(&url);
    if kind == UrlKind::Playlist {
        let _ = bot
            .edit_message_text(chat, status.id, "Detected playlist URL - downloading all items...")
            .await;
    }

    let (events, reporter) = ProgressReporter::spawn(bot.clone(), chat, status.id);
    let ytdlp = YtDlp::new(config.ytdlp_bin.clone());
    let cookie_path = cookies.resolve(chat.0);

    let result = match kind {
        UrlKind::Single => ytdlp
            .download_single(&url, cookie_path.as_deref(), events.clone())
            .await
            .map(|(artifact, dir)| (vec![artifact], dir)),
        UrlKind::Playlist => {
            ytdlp
                .download_playlist(&url, cookie_path.as_deref(), events.clone(), config.max_playlist_items)
                .await
        }
    };
    // Close the channel so the reporter drains and stops before the
    // delivery phase takes over the status message.
    drop(events);
    let _ = reporter.await;

    let (artifacts, _dir) = match result {
        Ok(output) => output,
        Err(e) => {
            error!("chat {chat}: download of {url} failed: {e}");
            let _ = bot.edit_message_text(chat, status.id, user_message(&e)).await;
            return;
        }
    };

    if artifacts.is_empty() {
        let _ = bot.edit_message_text(chat, status.id, "No MP3 files were produced.").await;
        return;
    }

    info!("chat {chat}: delivering {} file(s)", artifacts.len());
    if artifacts.len() == 1 {
        deliver_one(&bot, chat, status.id, &artifacts[0]).await;
    } else {
        deliver_batch(&bot, chat, status.id, &artifacts).await;
    }
    // _dir drops here; the owning temp directory is removed.
}

/// What the user sees when the pipeline fails. Auth failures get
/// actionable guidance instead of the raw yt-dlp error dump.
fn user_message(error: &DownloadError) -> String {
    match error {
        DownloadError::AuthRequired => AUTH_GUIDANCE.to_string(),
        other => format!("Download failed: {other}"),
    }
}

async fn deliver_one(bot: &Bot, chat: ChatId, status: MessageId, artifact: &Artifact) {
    if !artifact.path.is_file() {
        let _ = bot
            .edit_message_text(chat, status, format!("MP3 file not found: {}", artifact.path.display()))
            .await;
        return;
    }
    match send_audio(bot, chat, artifact).await {
        Ok(()) => {
            let _ = bot.delete_message(chat, status).await;
        }
        Err(e) => {
            warn!("chat {chat}: audio upload failed ({e}), falling back to document");
            match send_document(bot, chat, artifact).await {
                Ok(()) => {
                    let _ = bot.delete_message(chat, status).await;
                }
                Err(e2) => {
                    error!("chat {chat}: document fallback also failed: {e2}");
                    let _ = bot
                        .edit_message_text(chat, status, format!("Failed to send audio file: {e}"))
                        .await;
                }
            }
        }
    }
}

/// Sequential, order-preserving playlist delivery. A single item's upload
/// failure never aborts the batch.
async fn deliver_batch(bot: &Bot, chat: ChatId, status: MessageId, artifacts: &[Artifact]) {
    let total = artifacts.len();
    for (index, artifact) in artifacts.iter().enumerate() {
        let position = index + 1;
        if !artifact.path.is_file() {
            let _ = bot
                .send_message(chat, format!("[{position}/{total}] File missing or skipped: {}", artifact.file_name()))
                .await;
            continue;
        }

        let _ = bot
            .send_message(chat, format!("Sending [{position}/{total}]: {}", artifact.file_name()))
            .await;

        if let Err(e) = send_audio(bot, chat, artifact).await {
            warn!("chat {chat}: audio upload of {} failed ({e}), trying document", artifact.file_name());
            if let Err(e2) = send_document(bot, chat, artifact).await {
                warn!("chat {chat}: skipping {}: {e2}", artifact.file_name());
            }
        }

        tokio::time::sleep(INTER_ITEM_DELAY).await;
    }
    let _ = bot.delete_message(chat, status).await;
}

async fn send_audio(bot: &Bot, chat: ChatId, artifact: &Artifact) -> Result<(), DownloadError> {
    let input = InputFile::file(&artifact.path).file_name(artifact.file_name());
    bot.send_audio(chat, input)
        .await
        .map(|_| ())
        .map_err(|e| DownloadError::UploadFailed(e.to_string()))
}

async fn send_document(bot: &Bot, chat: ChatId, artifact: &Artifact) -> Result<(), DownloadError> {
    let input = InputFile::file(&artifact.path).file_name(artifact.file_name());
    bot.send_document(chat, input)
        .caption(artifact.file_name())
        .await
        .map(|_| ())
        .map_err(|e| DownloadError::UploadFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn auth_failure_gets_guidance_not_raw_error() {
        let text = user_message(&DownloadError::AuthRequired);
        assert!(text.contains("/setcookies"));
        assert!(text.contains("/setcookies_paste"));
        assert!(!text.contains("Download failed"));
    }

    #[test]
    fn other_failures_keep_the_cause() {
        let text = user_message(&DownloadError::Failed("geo restricted".into()));
        assert_eq!(text, "Download failed: download failed: geo restricted");

        let text = user_message(&DownloadError::TooManyItems { count: 120, limit: 50 });
        assert!(text.contains("120"));
        assert!(text.contains("50"));
    }

    #[test]
    fn missing_file_message_names_the_path() {
        let text = user_message(&DownloadError::FileMissing(PathBuf::from("/tmp/x")));
        assert!(text.contains("/tmp/x"));
    }
}
