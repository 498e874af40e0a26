use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, Document};
use teloxide::update_listeners::webhooks;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cookies::CookieStore;
use crate::delivery;

const START_TEXT: &str = "\u{1F44B} Hello! Use /yt <url> or send /yt and then \
    reply with the URL to download the audio as MP3.";

const HELP_TEXT: &str = "Usage:\n\
    /yt <url> - download audio as MP3 (playlists are detected automatically)\n\
    Or: send /yt and then paste the URL as the next message.\n\n\
    Restricted sources:\n\
    /setcookies - upload a cookies.txt file as a document\n\
    /setcookies_paste - paste the cookies.txt contents directly\n\
    /cleancookies - remove the stored cookies for this chat\n\
    /listcookies - show whether cookies are stored for this chat";

/// What the next non-command update from a chat means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Session {
    #[default]
    Idle,
    AwaitingUrl,
    AwaitingCookiePaste,
    AwaitingCookieFile,
}

#[derive(Clone)]
struct BotState {
    config: Arc<Config>,
    cookies: Arc<CookieStore>,
    sessions: Arc<Mutex<HashMap<i64, Session>>>,
}

pub async fn run(config: Config, cookies: CookieStore) -> Result<()> {
    let bot = Bot::new(&config.token);

    let commands = vec![
        BotCommand::new("start", "Show the welcome message"),
        BotCommand::new("help", "Show usage help"),
        BotCommand::new("yt", "Download a URL as MP3"),
        BotCommand::new("setcookies", "Upload a cookies.txt file"),
        BotCommand::new("setcookies_paste", "Paste cookies.txt contents"),
        BotCommand::new("cleancookies", "Remove stored cookies"),
        BotCommand::new("listcookies", "Show stored-cookie status"),
    ];
    if let Err(e) = bot.set_my_commands(commands).await {
        error!("failed to register bot commands: {e}");
    }

    let state = BotState {
        config: Arc::new(config),
        cookies: Arc::new(cookies),
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    match state.config.webhook.clone() {
        Some(webhook) => {
            info!("starting webhook listener on port {}", webhook.port);
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], webhook.port));
            let listener = webhooks::axum(bot.clone(), webhooks::Options::new(addr, webhook.url))
                .await
                .map_err(|e| anyhow::anyhow!("failed to start webhook listener: {e}"))?;
            teloxide::repl_with_listener(
                bot,
                move |bot: Bot, msg: Message| {
                    let state = state.clone();
                    async move { handle_update(bot, msg, state).await }
                },
                listener,
            )
            .await;
        }
        None => {
            info!("starting long-polling dispatcher");
            teloxide::repl(bot, move |bot: Bot, msg: Message| {
                let state = state.clone();
                async move { handle_update(bot, msg, state).await }
            })
            .await;
        }
    }
    Ok(())
}

async fn handle_update(bot: Bot, msg: Message, state: BotState) -> ResponseResult<()> {
    let chat = msg.chat.id;

    if let Some(document) = msg.document() {
        let awaiting = state.sessions.lock().await.remove(&chat.0).unwrap_or_default()
            == Session::AwaitingCookieFile;
        if awaiting {
            store_uploaded_cookies(&bot, chat, document, &state).await;
        }
        return Ok(());
    }

    let Some(text) = msg.text() else { return Ok(()) };
    let trimmed = text.trim();

    if !trimmed.starts_with('/') {
        handle_plain_text(&bot, chat, text, &state).await;
        return Ok(());
    }

    let (command, arg) = split_command(trimmed);
    match command {
        "/start" => {
            let _ = bot.send_message(chat, START_TEXT).await;
        }
        "/help" => {
            let _ = bot.send_message(chat, HELP_TEXT).await;
        }
        "/yt" => {
            if arg.is_empty() {
                let _ = bot
                    .send_message(chat, "Please send the URL of the song you want as MP3.")
                    .await;
                state.sessions.lock().await.insert(chat.0, Session::AwaitingUrl);
            } else {
                let _ = bot
                    .send_message(chat, format!("Downloading audio from: {arg} (this may take a while)..."))
                    .await;
                spawn_delivery(&bot, chat, arg.to_string(), &state);
            }
        }
        "/setcookies" => {
            state.sessions.lock().await.insert(chat.0, Session::AwaitingCookieFile);
            let _ = bot
                .send_message(chat, "Upload your cookies.txt file (Netscape format) as a document.")
                .await;
        }
        "/setcookies_paste" => {
            state.sessions.lock().await.insert(chat.0, Session::AwaitingCookiePaste);
            let _ = bot
                .send_message(chat, "Paste the contents of cookies.txt as your next message.")
                .await;
        }
        "/cleancookies" => {
            state.cookies.clear(chat.0);
            let _ = bot.send_message(chat, "Cookies removed for this chat.").await;
        }
        "/listcookies" => {
            let _ = bot.send_message(chat, state.cookies.describe(chat.0)).await;
        }
        "/listallcookies" => {
            let from_id = msg.from.as_ref().map(|user| user.id.0);
            if state.config.owner_id.is_some() && from_id == state.config.owner_id {
                let _ = bot.send_message(chat, state.cookies.describe_all()).await;
            } else {
                let _ = bot
                    .send_message(chat, "This command is restricted to the bot owner.")
                    .await;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn handle_plain_text(bot: &Bot, chat: ChatId, text: &str, state: &BotState) {
    let session = state.sessions.lock().await.remove(&chat.0).unwrap_or_default();
    match session {
        Session::AwaitingUrl => {
            let url = text.trim().to_string();
            let _ = bot
                .send_message(chat, format!("Received URL: {url}\nStarting download..."))
                .await;
            spawn_delivery(bot, chat, url, state);
        }
        Session::AwaitingCookiePaste => {
            let reply = if state.cookies.set_from_text(chat.0, text) {
                "Cookies saved for this chat."
            } else {
                "Could not store the pasted cookies, try again."
            };
            let _ = bot.send_message(chat, reply).await;
        }
        Session::AwaitingCookieFile => {
            // keep waiting for the actual document
            state.sessions.lock().await.insert(chat.0, Session::AwaitingCookieFile);
            let _ = bot
                .send_message(chat, "Please upload the cookies.txt file as a document.")
                .await;
        }
        Session::Idle => {}
    }
}

fn spawn_delivery(bot: &Bot, chat: ChatId, url: String, state: &BotState) {
    info!("chat {chat}: download requested for {url}");
    tokio::spawn(delivery::deliver(
        bot.clone(),
        chat,
        url,
        state.config.clone(),
        state.cookies.clone(),
    ));
}

async fn store_uploaded_cookies(bot: &Bot, chat: ChatId, document: &Document, state: &BotState) {
    let file = match bot.get_file(document.file.id.clone()).await {
        Ok(file) => file,
        Err(e) => {
            error!("chat {chat}: failed to access uploaded document: {e}");
            let _ = bot.send_message(chat, "Failed to access the uploaded file.").await;
            return;
        }
    };

    let mut buf = Vec::new();
    if let Err(e) = bot.download_file(&file.path, &mut buf).await {
        warn!("chat {chat}: failed to download cookie file: {e}");
        let _ = bot
            .send_message(chat, "Failed to download the uploaded file, try again.")
            .await;
        return;
    }

    let reply = if state.cookies.set_from_bytes(chat.0, &buf) {
        "Cookies saved for this chat."
    } else {
        "Could not store the uploaded cookies, try again."
    };
    let _ = bot.send_message(chat, reply).await;
}

/// First token of a command message, with any `@botname` mention stripped,
/// plus the remaining argument text.
fn split_command(text: &str) -> (&str, &str) {
    let mut parts = text.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let command = command.split('@').next().unwrap_or(command);
    let arg = parts.next().unwrap_or_default().trim();
    (command, arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command_has_empty_arg() {
        assert_eq!(split_command("/yt"), ("/yt", ""));
    }

    #[test]
    fn argument_is_trimmed() {
        assert_eq!(
            split_command("/yt   https://youtube.com/watch?v=a "),
            ("/yt", "https://youtube.com/watch?v=a")
        );
    }

    #[test]
    fn bot_mention_is_stripped() {
        assert_eq!(split_command("/yt@tune_bot https://x"), ("/yt", "https://x"));
    }

    #[test]
    fn sessions_default_to_idle() {
        assert_eq!(Session::default(), Session::Idle);
    }
}
