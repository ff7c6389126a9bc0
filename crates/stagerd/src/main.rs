//! stagerd — parallel data staging daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use stager_core::config::StagerConfig;
use stager_services::{
    make_transport, DataReceiver, EngineOptions, RequestTracker, RunQueue, Scheduler, ShapingGate,
    TransferEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StagerConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = StagerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StagerConfig::default()
    });

    let backend = config.transport.backend.clone();
    tracing::info!(
        backend,
        api_port = config.network.api_port,
        data_port = config.network.data_port,
        workers_per_node = config.staging.workers_per_node,
        "stagerd starting"
    );

    let transport = make_transport(
        &backend,
        Duration::from_millis(config.retry.rpc_timeout_ms),
    )?;
    let transport_name = transport.name();

    // Shared state
    let tracker = RequestTracker::new();
    let queue = RunQueue::new();
    let shaping = ShapingGate::new();
    let engine = Arc::new(TransferEngine::new(
        transport.clone(),
        tracker.clone(),
        queue.clone(),
        shaping.clone(),
        EngineOptions::from_config(&config),
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Scheduler and node contexts ──────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        tracker.clone(),
        engine.clone(),
        config.staging.workers_per_node,
        shutdown_tx.clone(),
    ));
    for node in &config.staging.nodes {
        scheduler.add_node(node);
    }
    tracing::info!(
        nodes = config.staging.nodes.len(),
        workers = scheduler.nodes().len() * config.staging.workers_per_node as usize,
        "worker pool ready"
    );

    // ── Data receiver (tcp backend only) ─────────────────────────────────────
    let receiver_task = if backend == "tcp" {
        let receiver = DataReceiver::bind(config.network.data_port).await?;
        let shutdown = shutdown_tx.clone();
        Some(tokio::spawn(receiver.run(shutdown)))
    } else {
        None
    };

    // ── HTTP API ─────────────────────────────────────────────────────────────
    let api_task = {
        let state = stager_api::ApiState {
            engine: engine.clone(),
            tracker: tracker.clone(),
            scheduler: scheduler.clone(),
            shaping: shaping.clone(),
            transport_name,
            started_at: Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = stager_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
    }

    // Drain workers: no new tasks are handed out once the queue closes.
    queue.close();
    if let Some(task) = receiver_task {
        task.abort();
    }

    Ok(())
}
