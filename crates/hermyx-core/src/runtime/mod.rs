//! Process lifecycle.
//!
//! Builds the data plane from a resolved config, binds the listener, writes
//! the PID file, serves until SIGINT/SIGTERM, then drains in-flight
//! requests, closes both backends, and removes the PID file.

use crate::{
    cache::{build_store, CacheError, CacheManager},
    config::{ConfigError, HermyxConfig},
    proxy::{ProxyEngine, ProxyError},
    ratelimit::{build_limiter, RateLimitError, RateLimitManager},
    routing::RouteTable,
};
use axum::{
    extract::{ConnectInfo, State},
    response::Response,
    Router,
};
use http::Request;
use std::{net::SocketAddr, path::Path, sync::Arc};
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

const PID_FILE_NAME: &str = "hermyx.pid";

/// Errors that abort startup or surface during teardown.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("unable to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("unable to write pid file: {0}")]
    PidFile(#[source] std::io::Error),
}

/// Builds the proxy engine from a loaded, defaulted, validated config.
///
/// Exposed separately from [`run`] so tests can exercise the full pipeline
/// in-process without binding a listener.
///
/// # Errors
///
/// Returns an error when route compilation, backend construction, or
/// upstream client preparation fails.
pub async fn build_engine(config: &HermyxConfig) -> Result<Arc<ProxyEngine>, RuntimeError> {
    let routes = RouteTable::compile(config)?;
    info!(routes = routes.len(), "routes compiled");

    let storage_path = config.storage_path()?;
    let store = build_store(&config.cache, storage_path).await?;
    let cache = CacheManager::new(store);

    let limiter = match &config.rate_limit {
        Some(rate_limit) => build_limiter(rate_limit)?,
        None => None,
    };
    let rate_limit = RateLimitManager::new(limiter);
    info!("rate limit manager initialized");

    let upstreams = crate::proxy::UpstreamPool::new(config.server.upstream_timeout);
    let engine = ProxyEngine::new(routes, cache, rate_limit, upstreams)?;

    Ok(Arc::new(engine))
}

async fn handle_any(
    State(engine): State<Arc<ProxyEngine>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
) -> Response {
    engine.handle(request, Some(remote_addr)).await
}

/// Runs the proxy to completion: serve until a shutdown signal, then tear
/// everything down.
///
/// # Errors
///
/// Returns an error when startup fails; serve-phase I/O errors are also
/// surfaced after cleanup has run.
pub async fn run(config: HermyxConfig) -> Result<(), RuntimeError> {
    let engine = build_engine(&config).await?;
    let storage_path = config.storage_path()?.to_path_buf();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .map_err(|source| RuntimeError::Bind { port: config.server.port, source })?;
    let local_addr = listener.local_addr().map_err(RuntimeError::Serve)?;
    info!(address = %local_addr, "hermyx listening");

    write_pid_file(&storage_path)?;

    let app = Router::new().fallback(handle_any).with_state(Arc::clone(&engine));

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("shutdown signal received, cleaning up");
    engine.shutdown().await;
    remove_pid_file(&storage_path);
    info!("hermyx shut down gracefully");

    serve_result.map_err(RuntimeError::Serve)
}

/// Completes when SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Path of the PID file inside a storage directory.
#[must_use]
pub fn pid_file_path(storage_path: &Path) -> std::path::PathBuf {
    storage_path.join(PID_FILE_NAME)
}

fn write_pid_file(storage_path: &Path) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(storage_path).map_err(RuntimeError::PidFile)?;
    let path = pid_file_path(storage_path);
    std::fs::write(&path, std::process::id().to_string()).map_err(RuntimeError::PidFile)?;
    info!(path = %path.display(), "pid file written");
    Ok(())
}

fn remove_pid_file(storage_path: &Path) {
    let path = pid_file_path(storage_path);
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove pid file");
    } else {
        info!("pid file removed");
    }
}
