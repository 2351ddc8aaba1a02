//! Mercato sync service.
//!
//! Hosts the inbound webhook gateway and the task status API, and runs
//! the sync worker against the shared task queue. Any number of
//! instances can run side by side: the queue, the lock broker and the
//! sync record store all live in Postgres.

mod config;
mod logging;

use axum::routing::get;
use axum::{Json, Router};
use config::Config;
use mercato_engine::{
    AlertSink, HttpAlertSink, JobRunner, LockBroker, NoopAlertSink, PgLeaseBroker, SyncWorker,
    WorkerConfig,
};
use mercato_webhooks::{webhooks_router, WebhooksState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        worker_concurrency = config.worker_concurrency,
        "Starting mercato sync service"
    );

    let pool = match mercato_db::connect(&config.database_url, config.database_max_connections).await
    {
        Ok(pool) => {
            info!("Database connection established");
            pool
        }
        Err(e) => {
            eprintln!("Failed to connect to database: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = mercato_db::run_migrations(&pool).await {
        eprintln!("Failed to run migrations: {e}");
        std::process::exit(1);
    }

    // Alerting is fire-and-forget; without a configured URL it is a
    // no-op sink.
    let alerts: Arc<dyn AlertSink> = match &config.alert_webhook_url {
        Some(url) => Arc::new(HttpAlertSink::new(url.clone())),
        None => Arc::new(NoopAlertSink),
    };

    let broker: Arc<dyn LockBroker> = Arc::new(PgLeaseBroker::new(pool.clone()));
    let runner = Arc::new(JobRunner::new(
        pool.clone(),
        Some(broker),
        alerts.clone(),
    ));

    // Start the sync worker.
    let worker = Arc::new(SyncWorker::new(
        pool.clone(),
        runner.clone(),
        alerts,
        WorkerConfig {
            concurrency: config.worker_concurrency,
            ..Default::default()
        },
    ));
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    let state = WebhooksState::new(pool.clone(), runner);
    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(webhooks_router(state))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            config.max_body_size,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr: SocketAddr = match config.bind_addr().parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address '{}': {e}", config.bind_addr());
            std::process::exit(1);
        }
    };

    info!(%addr, "Server listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to address {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }

    // Drain the worker before exiting so in-flight tasks finish.
    worker.shutdown();
    let _ = worker_handle.await;
    info!("Server shutdown complete");
}

/// Liveness probe.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Graceful shutdown on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
