use anyhow::Result;
use counsel_api::{run as run_api, AppState};
use counsel_core::{Config, CounselContext};
use std::env;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // LOG_FORMAT=json switches to one JSON object per line for log shippers.
    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting Counsel server");

    let config = Config::from_env();
    let ctx = CounselContext::new(config).await?;
    tracing::info!(
        store = ?ctx.config.backends.store,
        bus = ?ctx.config.backends.bus,
        "Counsel context initialized"
    );

    let state = AppState::new(&ctx);

    tokio::select! {
        result = run_api(state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
