//! Cascade server binary.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cascade_server::{build_router, config::ServerConfig, state::AppState};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cascade=debug,cascade_server=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_result = ServerConfig::from_env();
    let json_logs = config_result.as_ref().is_ok_and(|c| c.log_json);
    init_tracing(json_logs);

    let config = match config_result {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid CASCADE_* configuration");
            return Err(anyhow::Error::new(e).context("Failed to load configuration"));
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        "Starting cascade server"
    );

    let state = AppState::from_config(&config)?;

    let periodic_sync = match (&state.reconciler, config.sync_interval()) {
        (Some(reconciler), Some(interval)) => {
            tracing::info!(interval_secs = interval.as_secs(), "Periodic workflow sync enabled");
            Some(reconciler.clone().spawn_periodic())
        }
        _ => None,
    };

    let app = build_router(state);
    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = periodic_sync {
        handle.abort();
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
