use anyhow::{Context, Result};
use rollcall_core::FaceMatcher;
use rollcall_store::{AttendanceStore, MemoryStore, SqliteStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod broadcaster;
mod config;
mod coordinator;
mod engine;
mod error;
mod ingress;
mod locks;
mod reconciler;
mod retention;
mod server;

use broadcaster::Broadcaster;
use config::Config;
use coordinator::Coordinator;
use engine::HttpEngineClient;
use ingress::WebhookIngress;
use reconciler::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env()?;

    let store: Arc<dyn AttendanceStore> = if config.memory_store {
        tracing::warn!("using in-memory store; attendance is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let store = SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening {}", config.db_path.display()))?;
        tracing::info!(path = %config.db_path.display(), "attendance store opened");
        Arc::new(store)
    };

    let engine = HttpEngineClient::new(&config.engine_url, config.engine_timeout)
        .context("building engine client")?;
    let coordinator = Coordinator::new(Arc::new(engine), config.engine_timeout);

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        coordinator.clone(),
        Arc::new(FaceMatcher::new(config.distance_metric)),
        config.match_threshold,
        config.staff_id,
    ));
    let broadcaster = Arc::new(Broadcaster::new());
    let ingress = Arc::new(WebhookIngress::new(reconciler, broadcaster.clone()));

    let sweeper = retention::spawn_sweeper(
        store,
        config.idempotency_retention,
        config.sweep_interval,
    );

    let app = server::router(server::AppState {
        ingress,
        coordinator,
        broadcaster: broadcaster.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        engine = %config.engine_url,
        threshold = config.match_threshold,
        metric = ?config.distance_metric,
        "rollcalld ready"
    );

    let hub = broadcaster.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("rollcalld shutting down");
            // Dropping subscriber channels lets open WebSockets wind down.
            hub.shutdown().await;
        })
        .await?;

    sweeper.abort();
    tracing::info!("rollcalld stopped");
    Ok(())
}
