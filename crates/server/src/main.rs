// crates/server/src/main.rs
//! iAvatar server binary.
//!
//! Validates configuration, clears stale staging files, starts the job
//! sweeper, and serves HTTP until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use iavatar_core::{CommandPipeline, InferencePipeline};
use iavatar_observability::init_tracing;
use iavatar_server::{create_app, init_metrics, metrics::record_slots_available, AppState, Config};
use iavatar_server_jobs::spawn_sweeper;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = Instant::now();

    // Step 1: Configuration and logging
    let config = Config::load();
    config.validate()?;
    let _log_guard = init_tracing(&config.log_config())?;
    init_metrics();

    eprintln!("\n\u{1f3ac} iavatar v{}\n", env!("CARGO_PKG_VERSION"));

    // Step 2: Inference pipeline
    let pipeline = Arc::new(CommandPipeline::new(
        config.pipeline_root.clone(),
        config.python.clone(),
    ));
    if pipeline.is_initialized() {
        tracing::info!(
            root = %pipeline.root().display(),
            gpu_available = pipeline.gpu_available(),
            "Inference pipeline ready"
        );
    } else {
        tracing::warn!(
            root = %pipeline.root().display(),
            "Inference pipeline not found; generation requests will be rejected"
        );
    }

    // Step 3: Shared state. Job ids do not survive a restart, so anything
    // left in the staging directory is unreachable.
    let state = AppState::new(config.clone(), pipeline).context("failed to open staging dir")?;
    let purged = state.staging.purge()?;
    if purged > 0 {
        tracing::info!(purged, dir = %state.staging.root().display(), "Removed stale staging entries");
    }
    record_slots_available(state.scheduler.gate().available());

    // Step 4: Background sweeper
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(&state.registry),
        config.job_ttl(),
        config.sweep_interval(),
        shutdown.clone(),
    );

    // Step 5: Bind and serve
    let addr = SocketAddr::new(config.host, config.port());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        %addr,
        max_concurrent_inference = config.max_concurrent_inference,
        inference_timeout_secs = config.inference_timeout_seconds,
        job_ttl_secs = config.job_ttl_seconds,
        "Server listening"
    );
    eprintln!(
        "  \u{2713} Ready in {}ms\n  \u{2192} http://{}\n",
        startup_start.elapsed().as_millis(),
        addr
    );

    let app = create_app(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Step 6: Drain. Jobs still waiting for a slot stay Queued.
    shutdown.cancel();
    state.scheduler.gate().close();
    sweeper.await.context("sweeper task panicked")?;
    tracing::info!(remaining_jobs = state.registry.len(), "Server stopped");

    Ok(())
}
