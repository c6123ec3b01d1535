use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use vidrelay_bot::bot::Bot;
use vidrelay_bot::catalog::Catalog;
use vidrelay_bot::config::Config;
use vidrelay_bot::drive::{DriveClient, StorageProvider};
use vidrelay_bot::health::{self, HealthState};
use vidrelay_bot::hydrax::HydraxClient;
use vidrelay_bot::messaging::Messenger;
use vidrelay_bot::pipeline::Pipeline;
use vidrelay_bot::registry::Registry;
use vidrelay_bot::supervisor::Supervisor;
use vidrelay_bot::telegram::TelegramClient;
use vidrelay_bot::util::now_ms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(config.download_dir()).with_context(|| {
        format!("failed to create DATA_DIR at {}", config.data_dir.display())
    })?;
    if config.whitelisted_users.is_empty() {
        tracing::warn!("WHITELISTED_USERS is empty; every user may use the bot");
    } else {
        tracing::info!("{} whitelisted users", config.whitelisted_users.len());
    }

    let db_path = config.db_path();
    let registry = Arc::new(Registry::open(&db_path)?);
    let supervisor = Arc::new(Supervisor::new());

    let http = reqwest::Client::builder()
        .user_agent(concat!("vidrelay-bot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let telegram = Arc::new(TelegramClient::new(
        http.clone(),
        config.telegram_api_base.clone(),
        config.bot_token.clone(),
    ));
    let messenger = Arc::new(Messenger::new(telegram.clone()));
    let storage: Arc<dyn StorageProvider> = Arc::new(DriveClient::new(
        http.clone(),
        config.google_token.clone(),
        config.drive_folder_id.clone(),
    ));
    let importer = Arc::new(HydraxClient::new(
        http,
        config.hydrax_api_base.clone(),
        config.hydrax_api_key.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        messenger.clone(),
        supervisor.clone(),
        telegram.clone(),
        storage.clone(),
        importer,
        config.download_dir(),
    ));
    let catalog = Arc::new(Catalog::new(registry.clone(), storage.clone()));
    let bot = Arc::new(Bot::new(
        telegram,
        messenger.clone(),
        pipeline,
        catalog,
        storage,
        supervisor.clone(),
        config.clone(),
    ));

    let shutdown = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let health_state = HealthState {
        data_dir: config.data_dir.clone(),
        db_path,
        supervisor: supervisor.clone(),
    };
    let health_task = tokio::spawn(health::serve(addr, health_state, shutdown.clone()));

    let sweep_task = tokio::spawn({
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = registry.run(|r| r.sweep_stale_at(now_ms())).await {
                            tracing::warn!("periodic sweep failed: {e:#}");
                        }
                    }
                }
            }
        }
    });

    let bot_task = tokio::spawn(bot.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    let pending = supervisor.cancel_all();
    if pending > 0 {
        tracing::info!("waiting for {pending} items to wind down");
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while supervisor.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("{} items still in flight at exit", supervisor.in_flight());
    }
    supervisor.shutdown();
    messenger.clear();

    bot_task.await.context("bot task failed")??;
    sweep_task.await.context("sweep task failed")?;
    health_task.await.context("health task failed")??;
    tracing::info!("bye");
    Ok(())
}
