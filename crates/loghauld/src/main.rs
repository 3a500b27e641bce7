//! loghauld: GELF ingestion daemon.
//!
//! Usage: `loghauld [bind-address]`. Without an argument the listener
//! address comes from the config file.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use loghaul_core::config::LoghaulConfig;
use loghaul_services::Pipeline;

mod feed;
mod sink;

/// How often pipeline counters are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Load config
    if let Err(e) = LoghaulConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = LoghaulConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LoghaulConfig::default()
    });

    if let Some(arg) = std::env::args().nth(1) {
        config.listener.bind = arg
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address {arg:?}"))?;
    }
    tracing::info!(
        bind = %config.listener.bind,
        config = %LoghaulConfig::file_path().display(),
        "loghauld starting"
    );

    // ── Pipeline ─────────────────────────────────────────────────────────────
    let pipeline = Arc::new(
        Pipeline::builder()
            .config(&config)
            .sink(sink::JsonLinesSink)
            .build()
            .context("failed to build pipeline")?,
    );
    pipeline.start().context("failed to start pipeline")?;

    let socket = UdpSocket::bind(config.listener.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.listener.bind))?;
    tracing::info!(addr = %socket.local_addr()?, "listening for datagrams");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let feed_task = tokio::spawn(
        feed::UdpFeed::new(socket, pipeline.clone(), shutdown_tx.subscribe()).run(),
    );

    let stats_task = {
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        match serde_json::to_string(&pipeline.snapshot()) {
                            Ok(snapshot) => tracing::info!(%snapshot, "pipeline stats"),
                            Err(e) => tracing::warn!(error = %e, "failed to serialize stats"),
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    match feed_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "udp feed failed"),
        Err(e) => tracing::error!(error = %e, "udp feed task panicked"),
    }
    let _ = stats_task.await;

    let report = tokio::task::spawn_blocking(move || pipeline.stop())
        .await
        .context("pipeline stop task panicked")?
        .context("failed to stop pipeline")?;
    if report.abandoned() > 0 {
        tracing::warn!(
            abandoned = report.abandoned(),
            pending_chunk_sets = report.pending_chunk_sets,
            "shutdown drain incomplete"
        );
    }

    tracing::info!("loghauld stopped");
    Ok(())
}
