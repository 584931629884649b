//! Server wiring: engine, snapshot store and HTTP listener

use axum::Router;
use goalflow_core::{Engine, HttpStepClient, StepClient};
use goalflow_monitoring::EngineMetrics;
use goalflow_state_inmemory::{InMemorySnapshotStore, WriteBehindStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api;
use crate::config::ServerConfig;
use crate::error::ServerResult;

/// Main server implementation
pub struct GoalflowServer {
    config: ServerConfig,
    engine: Engine,
    store: Arc<WriteBehindStore>,
}

impl GoalflowServer {
    /// Server dispatching steps over HTTP
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_client(config, Arc::new(HttpStepClient::new()))
    }

    /// Server with a custom step client
    pub fn with_client(config: ServerConfig, client: Arc<dyn StepClient>) -> ServerResult<Self> {
        config.validate()?;
        let store = Arc::new(WriteBehindStore::new(
            Arc::new(InMemorySnapshotStore::new()),
            config.store.write_behind(),
        )?);
        let engine = Engine::builder(config.engine_config())
            .client(client)
            .store(store.clone())
            .observer(Arc::new(EngineMetrics::new()))
            .build();
        Ok(Self {
            config,
            engine,
            store,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &WriteBehindStore {
        &self.store
    }

    /// Routes with tracing and panic recovery applied
    pub fn router(self: &Arc<Self>) -> Router {
        api::build_router(self.clone())
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until Ctrl+C, then drain pending snapshots
    pub async fn run(self: Arc<Self>) -> ServerResult<()> {
        let retry_loop = self.engine.spawn_retry_loop();
        let health_loop = self.engine.spawn_health_loop();

        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            %addr,
            webhook_base_url = %self.engine.config().webhook_base_url,
            "Goalflow server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        retry_loop.abort();
        health_loop.abort();
        if let Err(e) = self.store.shutdown().await {
            warn!(error = %e, "Snapshot store did not shut down cleanly");
        }
        info!("Goalflow server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}
