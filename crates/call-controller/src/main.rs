//! Call Controller
//!
//! Entry point for the call matcher's server process. Serves the end-call
//! API, health and metrics, and runs the pairing reaction and sweeper.

use call_controller::config::{self, Config, StoreBackend};
use call_controller::observability::metrics::init_metrics_recorder;
use call_controller::routes::{self, AppState};
use call_controller::tasks::{start_pairing_reaction, start_sweeper};
use call_core::sweeper::Sweeper;
use call_store::{MemoryStore, RedisStore, SharedStore};
use common::secret::ExposeSecret;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let vars: HashMap<String, String> = std::env::vars().collect();

    // Initialize tracing; an invalid CC_LOG_JSON is reported by Config below.
    let log_json = config::log_json(&vars).unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_controller=debug,call_core=info,tower_http=debug".into()),
        )
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting Call Controller");

    let config = Config::from_vars(&vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        store_backend = config.store_backend.as_str(),
        jwt_clock_skew_seconds = config.jwt_clock_skew_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    let store: SharedStore = match &config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is not shared with other processes");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis { url } => {
            info!("Connecting to Redis...");
            let redis = RedisStore::connect(url.expose_secret())
                .await
                .map_err(|e| {
                    error!("Failed to connect to Redis: {}", e);
                    e
                })?
                .with_poll_interval(config.store_poll_interval());
            info!("Redis connection established");
            Arc::new(redis)
        }
    };

    let cancel_token = CancellationToken::new();

    let sweeper_handle = tokio::spawn(start_sweeper(
        Sweeper::new(Arc::clone(&store), config.call.clone()),
        config.sweep_interval(),
        cancel_token.child_token(),
    ));
    let pairing_handle = tokio::spawn(start_pairing_reaction(
        Arc::clone(&store),
        config.call.clone(),
        cancel_token.child_token(),
    ));

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;

    let state = Arc::new(AppState::new(store, config));
    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Call Controller listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(drain_seconds))
    .await?;

    info!("HTTP server stopped, stopping background tasks");
    cancel_token.cancel();
    for (name, handle) in [("sweeper", sweeper_handle), ("pairing", pairing_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Call Controller shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and the drain period is complete.
async fn shutdown_signal(drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    if drain_seconds > 0 {
        warn!("Draining connections for {} seconds...", drain_seconds);
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (CC_DRAIN_SECONDS=0)");
    }
}
