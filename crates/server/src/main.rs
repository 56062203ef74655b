use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use bridge_core::{Bridge, MissingLocalChat, MissingRemoteConnector};
use clap::Parser;
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

#[derive(Parser, Debug)]
#[command(about = "Bridge daemon between a local chat server and a remote chat service")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(long, default_value = "bridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings(&cli.config)?;
    if settings.local_chat_token.is_empty() {
        warn!("local_chat_token is empty; every transaction push will be rejected");
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let bridge = Bridge::new(
        settings.bridge,
        storage,
        Arc::new(MissingLocalChat),
        Arc::new(MissingRemoteConnector),
    );
    match bridge.restore_sessions().await {
        Ok(connected) => info!(connected, "sessions restored"),
        Err(err) => warn!("failed to restore sessions: {err}"),
    }

    let state = AppState {
        bridge,
        local_chat_token: settings.local_chat_token,
    };
    let app = api::build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "bridge listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
