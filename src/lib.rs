// Game Panel Setup - first-boot orchestrator for a dockerized game server

pub mod api;
pub mod auth;
pub mod config;
pub mod console;
pub mod docker;
pub mod finalize;
pub mod fs_util;
pub mod progress;
pub mod setup;
pub mod system_check;
pub mod wizard;

use config::{ConfigError, PanelConfig};
use thiserror::Error;
use tokio::signal;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Logging setup. `RUST_LOG` wins over the defaults.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        ["hyper=warn", "bollard=warn", "reqwest=warn"]
            .iter()
            .filter_map(|directive| directive.parse::<Directive>().ok())
            .fold(EnvFilter::new("info"), |filter, directive| filter.add_directive(directive))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run() -> Result<(), StartupError> {
    let config = PanelConfig::from_env()?;
    for dir in [
        config.setup_dir(),
        config.credentials_dir(),
        config.downloads_dir(),
        config.assets_dir(),
    ] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    tracing::info!("Data directory: {}", config.data_dir.display());
    if config.dev_mode {
        tracing::warn!("Development mode is on; skip and reset endpoints are enabled");
    }

    let bind_addr = config.bind_addr;
    let app = api::router(api::AppState::new(config)?);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Setup service listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Setup service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
