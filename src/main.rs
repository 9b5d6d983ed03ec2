use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info};

use fluxgate::{ChannelArchiveWriter, Proxy, ProxyRuntimeBuilder, ProxySettings};

/// Archive events buffered before new ones are dropped
const ARCHIVE_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting {} {}", fluxgate::NAME, fluxgate::VERSION);

    let settings = match std::env::var("FLUXGATE_CONFIG") {
        Ok(path) => ProxySettings::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        Err(_) => ProxySettings::from_env()?,
    };
    info!(
        bound_points = ?settings.bound_points,
        connection_per_host = settings.connection_per_host,
        skip_ssl_decryption = settings.skip_global_ssl_decryption,
        "Configuration loaded"
    );

    let (archive, mut events) = ChannelArchiveWriter::new(ARCHIVE_QUEUE);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "fluxgate::archive", "{}", json),
                Err(e) => debug!(target: "fluxgate::archive", error = %e, "Unserializable archive event"),
            }
        }
    });

    let runtime = ProxyRuntimeBuilder::new(settings)
        .archive(Arc::new(archive))
        .build()
        .context("Failed to build proxy runtime")?;

    let mut proxy = Proxy::new(runtime);
    let endpoints = proxy.start().await.context("Failed to start proxy")?;
    info!(endpoints = ?endpoints, "Proxy started");

    let stopped = proxy.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = stopped.cancelled() => {
            info!("Proxy stopped accepting connections");
        }
    }

    proxy.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    let json = std::env::var("FLUXGATE_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
