//! NoETL Workflow Engine Server
//!
//! Serves the engine API over HTTP. Actions run in-process or are handed to
//! remote workers over NATS JetStream, which report back through
//! `POST /api/actions/{id}/complete`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_workflow_engine::{
    config::{AppConfig, DatabaseConfig, EngineConfig, ExecutorKind, StoreKind},
    db::{create_pool, pool::init_schema, DbPool},
    engine::Engine,
    executor::{ActionExecutor, LocalExecutor, NatsExecutor},
    expression::JinjaEvaluator,
    handlers,
    nats::{publisher::connect, NatsPublisher},
    notify::NatsNotifier,
    state::AppState,
    store::{MemoryStore, PgStore, Store},
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,noetl_workflow_engine=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn open_store(app_config: &AppConfig) -> anyhow::Result<(Arc<dyn Store>, Option<DbPool>)> {
    match app_config.store {
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store, executions are lost on restart");
            Ok((Arc::new(MemoryStore::new()), None))
        }
        StoreKind::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            init_schema(&pool).await?;
            Ok((Arc::new(PgStore::new(pool.clone())), Some(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load app config, using defaults: {}", e);
        AppConfig::default()
    });
    init_tracing(app_config.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting NoETL Workflow Engine"
    );

    let engine_config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        store = ?app_config.store,
        executor = ?app_config.executor,
        completion_delay_ms = engine_config.completion_delay_ms,
        "Configuration loaded"
    );

    let (store, db_pool) = open_store(&app_config).await?;

    let nats_client = match &app_config.nats_url {
        Some(url) => Some(connect(url).await?),
        None if app_config.executor == ExecutorKind::Nats => {
            anyhow::bail!("NOETL_EXECUTOR=nats requires NOETL_NATS_URL");
        }
        None => {
            tracing::info!("NATS not configured, running without messaging");
            None
        }
    };

    let (completions_tx, completions_rx) = tokio::sync::mpsc::unbounded_channel();
    let executor: Arc<dyn ActionExecutor> = match (&app_config.executor, &nats_client) {
        (ExecutorKind::Nats, Some(client)) => {
            let publisher = NatsPublisher::new(
                client.clone(),
                &engine_config.actions_subject,
                &engine_config.actions_stream,
            )
            .await?;
            Arc::new(NatsExecutor::new(publisher))
        }
        _ => {
            let executor = LocalExecutor::new(completions_tx);
            tracing::info!(plugins = ?executor.list(), "Using local executor");
            Arc::new(executor)
        }
    };

    let events_subject = engine_config.events_subject.clone();
    let events_stream = format!("{}_events", engine_config.actions_stream);
    let mut engine = Engine::new(store, Arc::new(JinjaEvaluator::new()), executor, engine_config);
    if let Some(client) = nats_client {
        let publisher = NatsPublisher::new(client, &events_subject, &events_stream).await?;
        engine = engine.with_notifier(Arc::new(NatsNotifier::new(publisher)));
    }

    tokio::spawn(engine.clone().run_completion_loop(completions_rx));

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let state = AppState::new(engine, app_config, db_pool);
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
