use std::collections::HashSet;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events sent on a full channel are dropped rather than blocking the
/// process reader; the next progress line supersedes them anyway.
pub const CHANNEL_CAPACITY: usize = 64;

const EDIT_INTERVAL: Duration = Duration::from_secs(1);

/// One structured progress update from the download utility. Transient;
/// the latest event per item supersedes earlier ones for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Identity of the item being processed (the destination filename).
    pub item: Option<String>,
    /// `(index, total)` position within a playlist.
    pub position: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Downloading {
        /// Fractional completion in 0..=1, when the total size is known.
        fraction: Option<f64>,
        /// Transfer rate in bytes per second.
        rate: Option<f64>,
        /// Estimated seconds remaining.
        eta: Option<u64>,
    },
    Converting,
    Finished,
    Other(String),
}

impl ProgressEvent {
    /// Single human-readable status line for the bound message.
    pub fn render(&self) -> String {
        let prefix = match self.position {
            Some((index, total)) => format!("[{index}/{total}] "),
            None => String::new(),
        };
        match &self.phase {
            Phase::Downloading { fraction, rate, eta } => {
                let pct = match fraction {
                    Some(f) => format!("{:.1}%", f * 100.0),
                    None => "?%".to_string(),
                };
                let rate = match rate {
                    Some(r) => format!("{}/s", format_bytes(*r)),
                    None => "-".to_string(),
                };
                let eta = match eta {
                    Some(e) => format!("{e}s"),
                    None => "-".to_string(),
                };
                format!("{prefix}Downloading: {pct} \u{2022} {rate} \u{2022} ETA {eta}")
            }
            Phase::Converting => format!("{prefix}Converting to MP3..."),
            Phase::Finished => format!("{prefix}Download finished, converting to MP3..."),
            Phase::Other(status) => format!("Status: {status}"),
        }
    }
}

/// Binary-prefixed size formatting: 1536.0 -> "1.5KB".
fn format_bytes(mut value: f64) -> String {
    for unit in ["", "K", "M", "G", "T"] {
        if value.abs() < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}PB")
}

/// Edit admission policy: at most one edit per rolling window, except a
/// terminal `Finished` which always flushes; once an item has finished,
/// later `Downloading` events for that same item are discarded (yt-dlp
/// can emit them spuriously during post-processing).
#[derive(Default)]
pub struct Throttle {
    last_edit: Option<Instant>,
    finished: HashSet<String>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, event: &ProgressEvent, now: Instant) -> bool {
        match &event.phase {
            Phase::Downloading { .. } => {
                if let Some(item) = &event.item {
                    if self.finished.contains(item) {
                        return false;
                    }
                }
                if let Some(last) = self.last_edit {
                    if now.duration_since(last) < EDIT_INTERVAL {
                        return false;
                    }
                }
            }
            Phase::Finished => {
                if let Some(item) = &event.item {
                    self.finished.insert(item.clone());
                }
            }
            Phase::Converting | Phase::Other(_) => {}
        }
        self.last_edit = Some(now);
        true
    }
}

/// Parser state threaded across yt-dlp stdout lines: the current item
/// identity and playlist position apply to subsequent progress lines.
#[derive(Default)]
pub struct ParseState {
    item: Option<String>,
    position: Option<(u32, u32)>,
}

/// Parse one `--newline` stdout line from yt-dlp into a progress event.
///
/// Recognized shapes:
///   `[download] Downloading item 2 of 5`        (position, no event)
///   `[download] Destination: /tmp/x/1 - a.mp3`  (item identity, no event)
///   `[download]  45.3% of 10.00MiB at 1.23MiB/s ETA 00:12`
///   `[download] 100% of 10.00MiB in 00:05`      (terminal)
///   `[ExtractAudio] Destination: ...`           (converting)
pub fn parse_line(line: &str, state: &mut ParseState) -> Option<ProgressEvent> {
    if line.starts_with("[ExtractAudio]") {
        return Some(ProgressEvent {
            phase: Phase::Converting,
            item: state.item.clone(),
            position: state.position,
        });
    }
    if !line.contains("[download]") {
        return None;
    }
    if let Some(dest) = line.split("Destination: ").nth(1) {
        state.item = Some(dest.trim().to_string());
        return None;
    }

    let parts: Vec<&str> = line.split_whitespace().collect();

    // "[download] Downloading item 2 of 5"
    if let (Some(item_pos), Some(of_pos)) = (
        parts.iter().position(|p| *p == "item"),
        parts.iter().position(|p| *p == "of"),
    ) {
        if parts.get(item_pos.wrapping_sub(1)) == Some(&"Downloading") {
            if let (Some(index), Some(total)) = (
                parts.get(item_pos + 1).and_then(|p| p.parse().ok()),
                parts.get(of_pos + 1).and_then(|p| p.parse().ok()),
            ) {
                state.position = Some((index, total));
                return None;
            }
        }
    }

    let mut fraction = None;
    let mut rate = None;
    let mut eta = None;
    for (i, part) in parts.iter().enumerate() {
        if let Some(stripped) = part.strip_suffix('%') {
            if let Ok(pct) = stripped.parse::<f64>() {
                fraction = Some(pct.clamp(0.0, 100.0) / 100.0);
            }
        }
        if *part == "at" {
            rate = parts.get(i + 1).and_then(|p| parse_size(p));
        }
        if *part == "ETA" {
            eta = parts.get(i + 1).and_then(|p| parse_clock(p));
        }
    }

    let fraction = fraction?;
    // The completion line reads "100% of <size> in <time>".
    let phase = if fraction >= 1.0 && parts.contains(&"in") {
        Phase::Finished
    } else {
        Phase::Downloading {
            fraction: Some(fraction),
            rate,
            eta,
        }
    };
    Some(ProgressEvent {
        phase,
        item: state.item.clone(),
        position: state.position,
    })
}

/// "1.23MiB/s" or "~10.00MiB" -> bytes (per second).
fn parse_size(text: &str) -> Option<f64> {
    let text = text.trim_start_matches('~').trim_end_matches("/s");
    for (suffix, factor) in [
        ("KiB", 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("TiB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("B", 1.0),
    ] {
        if let Some(number) = text.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    None
}

/// "00:12" or "1:02:03" -> seconds.
fn parse_clock(text: &str) -> Option<u64> {
    let mut seconds = 0u64;
    for part in text.split(':') {
        seconds = seconds.checked_mul(60)? + part.parse::<u64>().ok()?;
    }
    Some(seconds)
}

/// Consumes progress events on a dedicated task and mirrors them into a
/// single editable status message. Edit failures (message deleted, rate
/// limited) are ignored; progress reporting never aborts a download.
pub struct ProgressReporter;

impl ProgressReporter {
    pub fn spawn(
        bot: Bot,
        chat: ChatId,
        message: MessageId,
    ) -> (mpsc::Sender<ProgressEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut throttle = Throttle::new();
            let mut last_text = String::new();
            while let Some(event) = rx.recv().await {
                if !throttle.admit(&event, Instant::now()) {
                    continue;
                }
                let text = event.render();
                if text == last_text {
                    continue;
                }
                last_text.clone_from(&text);
                let _ = bot.edit_message_text(chat, message, text).await;
            }
        });
        (tx, handle)
    }
}
