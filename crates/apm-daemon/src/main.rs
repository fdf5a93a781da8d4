//! apm-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects the pool,
//! runs migrations, spawns the pipeline workers, and starts the HTTP
//! server.  All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use apm_config::Config;
use apm_daemon::{routes, state};
use apm_pipeline::PipelineWorker;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = Config::from_env()?;

    let pool = apm_db::connect(&cfg.database_url).await?;
    apm_db::migrate(&pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::with_capacity(cfg.worker_concurrency);
    for i in 0..cfg.worker_concurrency {
        let worker = PipelineWorker::new(
            pool.clone(),
            cfg.batch_size,
            cfg.poll_interval,
            format!("worker-{i}"),
        );
        workers.push(worker.spawn(shutdown_rx.clone()));
    }

    let shared = Arc::new(state::AppState::new(pool));

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.ingest_port));
    info!("apm-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    // Workers finish their in-flight transaction before exiting; rolled-back
    // claims become reclaimable on the next start.
    info!("shutting down; draining pipeline workers");
    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }

    info!("apm-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
