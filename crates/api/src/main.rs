//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::state::build_provider;
use api::{AppState, Store};
use item_store::{InMemoryStore, PostgresStore};
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::ExpirySweeper;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the server over `store` until a shutdown signal arrives.
async fn serve<S: Store>(
    config: &Config,
    store: S,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let provider = build_provider(config)?;
    let state = Arc::new(AppState::new(store, provider, config));

    if config.webhook_secret.is_empty() {
        tracing::warn!("WEBHOOK_SECRET not set, every payment webhook will be rejected");
    }

    // Background sweeper, stopped after the server drains
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = ExpirySweeper::new(Arc::clone(&state.engine), config.sweep_interval())
        .spawn(shutdown_rx);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    sweeper.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the store and run
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(16).connect(url).await?;
            let store = PostgresStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL item store");
            serve(&config, store, metrics_handle).await?;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory item store");
            serve(&config, InMemoryStore::new(), metrics_handle).await?;
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
