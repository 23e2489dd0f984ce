/// Server setup and initialization
///
/// Wires together all components: execution store, job queue, funnel registry,
/// engine, trigger scheduler, trigger manager, workers and HTTP routes.

use crate::{
    api::{create_funnel_routes, create_webhook_routes, AppState},
    config::Config,
    funnel::FunnelRegistry,
    metrics::InMemoryMetrics,
    queue::{JobQueue, MemoryJobQueue},
    runtime::{ExecutionEngine, ExecutorRegistry, TriggerScheduler, WorkerPool},
    store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore},
    trigger::TriggerManager,
};
use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Running application: the router plus the background services behind it
pub struct App {
    pub router: Router,
    pub state: AppState,
    pub scheduler: Arc<TriggerScheduler>,
    pub workers: Arc<WorkerPool>,
}

impl App {
    /// Stop the cron scheduler and let workers settle their current jobs
    pub async fn shutdown(&self) {
        if let Err(e) = self.scheduler.stop().await {
            tracing::warn!("⚠️ Failed to stop trigger scheduler: {}", e);
        }
        self.workers.shutdown().await;
    }
}

/// Create the application with all routes and background services
///
/// Workers and the cron scheduler are started before the router is returned.
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("🗄️ Initializing execution store");
    let store: Arc<dyn ExecutionStore> = match &config.storage.database_url {
        Some(url) => {
            tracing::info!("📁 Using SQLite execution store: {}", url);
            Arc::new(
                SqliteExecutionStore::connect(url)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to open execution store: {}", e))?,
            )
        }
        None => {
            tracing::info!("🧠 Using in-memory execution store");
            Arc::new(MemoryExecutionStore::new())
        }
    };

    tracing::info!("📬 Initializing job queue");
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());

    tracing::info!("📊 Initializing funnel registry with built-in executors");
    let executors = Arc::new(ExecutorRegistry::with_builtins());
    let funnels = Arc::new(FunnelRegistry::new(executors));

    tracing::info!("🚀 Initializing execution engine");
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = Arc::new(ExecutionEngine::new(
        funnels,
        store,
        Arc::clone(&queue),
        metrics.clone(),
        config.engine.clone(),
    ));

    tracing::info!("⏰ Initializing trigger scheduler");
    let scheduler = Arc::new(
        TriggerScheduler::new(Arc::clone(&queue))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize trigger scheduler: {}", e))?,
    );
    scheduler.start().await?;

    let triggers = Arc::new(TriggerManager::new(Arc::clone(&engine), Arc::clone(&scheduler)));

    tracing::info!("👷 Starting {} queue workers", config.engine.workers);
    let workers = Arc::new(WorkerPool::new(Arc::clone(&engine), Arc::clone(&triggers)));
    workers.start().await;

    let state = AppState {
        engine,
        triggers,
        metrics,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_funnel_routes())
        .merge(create_webhook_routes())
        .with_state(state.clone());

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        state,
        scheduler,
        workers,
    })
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Funnelway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("🛑 Shutting down");
    app.shutdown().await;
    Ok(())
}

/// Health check with engine counters and queue depth
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let queue = match state.engine.queue().stats().await {
        Ok(stats) => json!(stats),
        Err(e) => json!({ "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "metrics": state.metrics.snapshot(),
        "queue": queue,
    }))
}
