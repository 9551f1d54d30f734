//! HTTP bridge for Meta AI generation.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use metaai::{create_router, AppState, Credentials, MetaAiClient, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metaai=info,tower_http=info".into()),
        )
        .with_target(true)
        .init();

    info!("Starting Meta AI bridge");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded successfully");

    // A cache from an earlier run fills in cookies the environment lacks.
    let cached = match &config.credentials_cache {
        Some(path) => match Credentials::load_from(path).await {
            Ok(credentials) => Some(credentials),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "credential cache not loaded");
                None
            }
        },
        None => None,
    };

    let mut builder = MetaAiClient::builder()
        .from_env(true)
        .http_proxy(config.http_proxy.clone())
        .https_proxy(config.https_proxy.clone())
        .request_timeout(config.request_timeout)
        .refresh_interval(config.refresh_interval)
        .cache_path(config.credentials_cache.clone());
    if let Some(credentials) = cached {
        builder = builder.credentials(credentials);
    }
    if let Some(url) = &config.base_url {
        builder = builder.base_url(url.clone());
    }
    if let Some(url) = &config.upload_url {
        builder = builder.upload_url(url.clone());
    }
    let client = builder.build().context("Failed to initialise the Meta AI client")?;

    let store = client.credentials();
    match store.refresh(false).await {
        Ok(true) if store.bearer_token().await.is_some() => {
            info!("Initial credential refresh complete")
        }
        Ok(true) => warn!("No access token found; uploads are unavailable until one is derived"),
        Ok(false) => warn!("Initial credential refresh failed; continuing with cookies only"),
        Err(err) => warn!(error = %err, "Initial credential refresh failed"),
    }
    let refresh_task = store.spawn_refresh_loop(config.refresh_interval);

    let state = Arc::new(AppState::new(client, &config));
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresh_task.abort();
    info!("Meta AI bridge shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating shutdown");
        }
    }
}
