//! Bot entrypoint
//!
//! Loads configuration, opens the database, wires the engine against the
//! live exchange (or the in-memory mock when no credentials are present)
//! and runs until SIGINT.

use std::sync::Arc;

use perpetua::config::AppConfig;
use perpetua::db::Database;
use perpetua::engine::Engine;
use perpetua::exchange::{BinanceRestClient, ExchangeApi, MockExchangeClient};
use perpetua::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    };

    let _log_guard = init_logging(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git = option_env!("BUILD_GIT_HASH").unwrap_or("unknown"),
        mode = %config.mode,
        symbol = %config.symbol,
        "perpetua starting"
    );

    let exchange: Arc<dyn ExchangeApi> = if config.api_key.is_empty() {
        tracing::warn!("no API credentials; running against the in-memory mock exchange");
        Arc::new(MockExchangeClient::new())
    } else {
        let client = BinanceRestClient::new(config.rest_client_config())?;
        client.sync_time().await?;
        Arc::new(client)
    };

    let database = Database::connect(&config.database_url).await?;
    let engine = Engine::new(&database, exchange, config).await?;
    let handles = engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received");
    engine.shutdown().await;

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "task join failed");
        }
    }

    tracing::info!("perpetua stopped");
    Ok(())
}
