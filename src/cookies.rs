use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;

const FILE_PREFIX: &str = "ytdlp_cookies_chat_";
const ENV_FILE_NAME: &str = "ytdlp_cookies_env.txt";

/// Per-chat cookie files with a TTL, living in the OS temp directory.
///
/// Every operation is best-effort: a filesystem error degrades to
/// "no credential" and is logged, never surfaced to the bot's control
/// flow. A download without cookies simply proceeds unauthenticated.
pub struct CookieStore {
    dir: PathBuf,
    ttl: Duration,
    env_cookie: Option<PathBuf>,
}

impl CookieStore {
    pub fn new(config: &Config) -> Self {
        let mut store = Self::with_dir(std::env::temp_dir(), config.cookie_ttl);
        if let Some(blob) = &config.env_cookies {
            let path = store.dir.join(ENV_FILE_NAME);
            match fs::write(&path, blob) {
                Ok(()) => {
                    info!("wrote process-wide cookies from YTDLP_COOKIES to {}", path.display());
                    store.env_cookie = Some(path);
                }
                Err(e) => warn!("failed to write YTDLP_COOKIES blob: {e}"),
            }
        }
        store
    }

    pub fn with_dir(dir: PathBuf, ttl: Duration) -> Self {
        Self { dir, ttl, env_cookie: None }
    }

    fn path_for(&self, chat_id: i64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{chat_id}.txt"))
    }

    /// Store an uploaded cookie file verbatim. Overwrites any prior record.
    pub fn set_from_bytes(&self, chat_id: i64, bytes: &[u8]) -> bool {
        let path = self.path_for(chat_id);
        match fs::write(&path, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to store cookies for chat {chat_id}: {e}");
                false
            }
        }
    }

    /// Store pasted cookie text. Overwrites any prior record.
    pub fn set_from_text(&self, chat_id: i64, text: &str) -> bool {
        self.set_from_bytes(chat_id, text.as_bytes())
    }

    /// The live cookie path for a chat, or `None` if absent or expired.
    /// An expired file is removed as a side effect.
    pub fn get(&self, chat_id: i64) -> Option<PathBuf> {
        let path = self.path_for(chat_id);
        if !path.is_file() {
            return None;
        }
        if self.is_expired(&path) {
            info!("cookies for chat {chat_id} exceeded their TTL, removing");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(path)
    }

    /// The chat's own cookies if live, otherwise the process-wide
    /// `YTDLP_COOKIES` file when one was configured.
    pub fn resolve(&self, chat_id: i64) -> Option<PathBuf> {
        self.get(chat_id)
            .or_else(|| self.env_cookie.clone().filter(|p| p.is_file()))
    }

    /// Remove a chat's cookie file. Idempotent.
    pub fn clear(&self, chat_id: i64) {
        let path = self.path_for(chat_id);
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove cookies for chat {chat_id}: {e}");
            }
        }
    }

    /// Remove every stored cookie file older than the TTL. Run at startup
    /// to bound storage growth from abandoned chats. Returns the number
    /// of files removed.
    pub fn sweep_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut removed = 0;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cookie sweep could not read {}: {e}", self.dir.display());
                return 0;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FILE_PREFIX) {
                continue;
            }
            let path = entry.path();
            if self.is_expired(&path) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("cookie sweep removed {removed} expired file(s)");
        }
        removed
    }

    /// A one-line status for `/listcookies`.
    pub fn describe(&self, chat_id: i64) -> String {
        match self.get(chat_id) {
            Some(path) => {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let age = file_age(&path).map(format_age).unwrap_or_else(|| "?".into());
                let expiry = if self.ttl.is_zero() {
                    "never expires".to_string()
                } else {
                    format!("TTL {}", format_age(self.ttl))
                };
                format!("Cookies stored for this chat: {size} bytes, set {age} ago ({expiry}).")
            }
            None => "No cookies stored for this chat.".to_string(),
        }
    }

    /// Every stored cookie file, one line each, for the owner-only command.
    pub fn describe_all(&self) -> String {
        let mut lines = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(id) = name
                    .strip_prefix(FILE_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".txt"))
                else {
                    continue;
                };
                let path = entry.path();
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let age = file_age(&path).map(format_age).unwrap_or_else(|| "?".into());
                lines.push(format!("chat {id}: {size} bytes, {age} old"));
            }
        }
        if lines.is_empty() {
            "No cookie files stored.".to_string()
        } else {
            lines.sort();
            format!("Stored cookie files:\n{}", lines.join("\n"))
        }
    }

    fn is_expired(&self, path: &Path) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        match file_age(path) {
            Some(age) => age > self.ttl,
            // Unreadable metadata counts as expired; the file is useless anyway.
            None => true,
        }
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 86_400 {
        format!("{}d", secs / 86_400)
    } else if secs >= 3_600 {
        format!("{}h", secs / 3_600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(ttl: Duration) -> (CookieStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::with_dir(dir.path().to_path_buf(), ttl);
        (store, dir)
    }

    #[test]
    fn pasted_text_round_trips_exactly() {
        let (store, _dir) = store(Duration::from_secs(3600));
        assert!(store.set_from_text(42, "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\n"));
        let path = store.get(42).expect("cookies should be live");
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content, "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\n");
    }

    #[test]
    fn set_overwrites_prior_record() {
        let (store, _dir) = store(Duration::ZERO);
        store.set_from_text(7, "old");
        store.set_from_text(7, "new");
        let path = store.get(7).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "new");
    }

    #[test]
    fn clear_removes_file_and_is_idempotent() {
        let (store, _dir) = store(Duration::ZERO);
        store.set_from_text(9, "data");
        let path = store.get(9).unwrap();
        store.clear(9);
        assert!(store.get(9).is_none());
        assert!(!path.exists());
        // second clear must not panic or error
        store.clear(9);
        assert!(store.get(9).is_none());
    }

    #[test]
    fn expired_cookies_are_removed_on_get() {
        let (store, _dir) = store(Duration::from_nanos(1));
        store.set_from_text(5, "stale");
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get(5).is_none());
        assert!(!_dir.path().join("ytdlp_cookies_chat_5.txt").exists());
    }

    #[test]
    fn zero_ttl_never_expires() {
        let (store, _dir) = store(Duration::ZERO);
        store.set_from_text(5, "keep");
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get(5).is_some());
    }

    #[test]
    fn sweep_removes_only_expired_prefix_files() {
        let (store, dir) = store(Duration::from_nanos(1));
        store.set_from_text(1, "a");
        store.set_from_text(2, "b");
        fs::write(dir.path().join("unrelated.txt"), "leave me").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.sweep_expired(), 2);
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn resolve_falls_back_to_env_cookie() {
        let (mut store, dir) = store(Duration::ZERO);
        let env_path = dir.path().join(ENV_FILE_NAME);
        fs::write(&env_path, "env cookies").unwrap();
        store.env_cookie = Some(env_path.clone());
        assert_eq!(store.resolve(123), Some(env_path));
        store.set_from_text(123, "chat cookies");
        assert_eq!(store.resolve(123), store.get(123));
    }

    #[test]
    fn describe_reports_presence() {
        let (store, _dir) = store(Duration::ZERO);
        assert!(store.describe(3).contains("No cookies"));
        store.set_from_text(3, "abc");
        assert!(store.describe(3).contains("3 bytes"));
    }
}
