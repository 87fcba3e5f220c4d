//! Process entry point: logging setup, service wiring, and the axum
//! server lifecycle. Grounded on the root `aerolithdb/src/main.rs`
//! startup/shutdown sequence.

use anyhow::Result;
use meterline_api::state::AppState;
use meterline_core::config::Config;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("meterline=info".parse()?))
        .json()
        .init();

    info!("starting usage metering service");

    let config = Config::load()?;
    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let state = match AppState::build(config).await {
        Ok(state) => {
            info!("service state initialized (store + cache connected)");
            state
        }
        Err(e) => {
            error!("failed to initialize service state: {e}");
            return Err(e);
        }
    };

    let app = meterline_api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("usage metering service stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, draining in-flight requests"),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }
}
