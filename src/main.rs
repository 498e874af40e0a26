mod bot;
mod config;
mod cookies;
mod delivery;
mod download;
mod error;

use anyhow::Result;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    if let Err(e) = run().await {
        error!("tunebot exited with an error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = config::Config::from_env()?;
    let cookies = cookies::CookieStore::new(&config);
    cookies.sweep_expired();

    info!("tunebot is starting...");
    bot::run(config, cookies).await
}
