use anyhow::{Context, Result};
use std::time::Duration;
use url::Url;

const DEFAULT_COOKIE_TTL_DAYS: u64 = 7;
const DEFAULT_MAX_PLAYLIST_ITEMS: usize = 50;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (`TELEGRAM_TOKEN`, required).
    pub token: String,
    /// How long a stored cookie file stays valid. Zero means never expires.
    pub cookie_ttl: Duration,
    /// Telegram user id allowed to run `/listallcookies`.
    pub owner_id: Option<u64>,
    /// Webhook transport; the bot long-polls when absent.
    pub webhook: Option<WebhookConfig>,
    /// Path or name of the yt-dlp binary.
    pub ytdlp_bin: String,
    /// Process-wide cookie blob supplied via `YTDLP_COOKIES`.
    pub env_cookies: Option<String>,
    /// Hard cap on files produced by a single playlist request.
    pub max_playlist_items: usize,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Url,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("TELEGRAM_TOKEN")
            .context("TELEGRAM_TOKEN environment variable is not set")?;

        let ttl_days = match std::env::var("COOKIES_TTL_DAYS") {
            Ok(v) => v
                .trim()
                .parse::<u64>()
                .context("COOKIES_TTL_DAYS must be a non-negative integer")?,
            Err(_) => DEFAULT_COOKIE_TTL_DAYS,
        };

        let owner_id = match std::env::var("OWNER_ID") {
            Ok(v) => Some(
                v.trim()
                    .parse::<u64>()
                    .context("OWNER_ID must be a Telegram user id")?,
            ),
            Err(_) => None,
        };

        let webhook = match (std::env::var("WEBHOOK_URL"), std::env::var("WEBHOOK_PORT")) {
            (Ok(raw), Ok(port)) => {
                let url = Url::parse(raw.trim()).context("WEBHOOK_URL is not a valid URL")?;
                let port = port
                    .trim()
                    .parse::<u16>()
                    .context("WEBHOOK_PORT must be a port number")?;
                Some(WebhookConfig { url, port })
            }
            _ => None,
        };

        let max_playlist_items = match std::env::var("MAX_PLAYLIST_ITEMS") {
            Ok(v) => v
                .trim()
                .parse::<usize>()
                .context("MAX_PLAYLIST_ITEMS must be a positive integer")?,
            Err(_) => DEFAULT_MAX_PLAYLIST_ITEMS,
        };

        Ok(Self {
            token,
            cookie_ttl: Duration::from_secs(ttl_days * 24 * 60 * 60),
            owner_id,
            webhook,
            ytdlp_bin: std::env::var("YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string()),
            env_cookies: std::env::var("YTDLP_COOKIES").ok().filter(|v| !v.trim().is_empty()),
            max_playlist_items,
        })
    }
}
