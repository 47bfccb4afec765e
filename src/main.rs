use std::time::Duration;

use userstore::{config::AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "userstore=debug,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    let interval = Duration::from_secs(config.sessions.cleanup_interval_secs.max(1));
    let state = AppState::init(config).await?;

    tracing::info!(?interval, "session cleanup sweep running");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.sessions.cleanup_expired().await {
                    Ok(removed) => tracing::debug!(removed, "sweep finished"),
                    Err(e) => tracing::error!(error = %e, "session cleanup failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    state.shutdown().await;
    Ok(())
}
