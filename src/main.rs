use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use wecom_relay::Config;
use wecom_relay::logging::open_log_file;
use wecom_relay::retry::{RetryConfig, RetryPolicy};
use wecom_relay::service::RelayService;
use wecom_relay::token::TokenCache;
use wecom_relay::transport::WeComTokenSource;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load());
    init_tracing(&config)?;

    // Check configuration before touching the network
    config.validate().context("Invalid configuration")?;

    // Access token refresher shared by every outbound send
    let token_source = WeComTokenSource::new(
        &config.wecom.api_base_url,
        &config.wecom.corp_id,
        &config.wecom.app_secret,
    )?;
    let tokens = TokenCache::new(
        Arc::new(token_source),
        config.token_safety_margin(),
        RetryPolicy::ExponentialBackoff(RetryConfig::from(&config.retry)),
    );
    tokens.start();

    let service = Arc::new(RelayService::from_config(config.clone(), tokens.clone())?);
    let router = service.router();

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(
        bind = %config.server.bind,
        path = %config.server.callback_path,
        "Starting WeCom callback server"
    );

    axum::serve(listener, router).await?;
    Ok(())
}

/// Log to `<logging.dir>/app.log` when configured, stdout otherwise
fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_file() {
        Some(path) => {
            let file = open_log_file(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            tracing::info!("Logging to file: {}", path.display());
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            tracing::info!("Logging to console");
        }
    }
    Ok(())
}
