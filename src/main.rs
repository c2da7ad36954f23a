//! xui-admin — Telegram-бот для администрирования панели 3x-ui.

mod bot;
mod config;
mod db;
mod link;
mod panel;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/xui-admin.toml"));
    tracing::info!("Starting xui-admin with config {}", config_path.display());

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        panel_url = %config.panel.base_url,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let session = Arc::new(panel::session::PanelSession::new(&config.panel)?);
    // недоступная панель на старте не фатальна: сессия перелогинится сама
    if let Err(error) = session.ensure_authenticated().await {
        tracing::warn!(error = %error, "Панель недоступна на старте, продолжаю без логина");
    }
    let online = Arc::new(panel::online::OnlineClientCache::new(
        session.clone(),
        Duration::from_secs(config.panel.online_ttl_secs),
    ));
    let mutator = Arc::new(panel::mutate::ClientMutator::new(session.clone()));

    let bot = Bot::new(token);
    let state = bot::handlers::BotState {
        config,
        db,
        session,
        online,
        mutator,
        awaiting_broadcast: Arc::new(Mutex::new(std::collections::HashSet::new())),
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
