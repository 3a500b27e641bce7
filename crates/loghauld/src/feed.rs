//! UDP feed: receives datagrams and submits them to the pipeline.
//!
//! `submit` may block when the process buffer uses the cached insert
//! policy, so it runs under `block_in_place` to keep the runtime's other
//! tasks moving.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use loghaul_core::message::RawDatagram;
use loghaul_services::{IngestError, Pipeline, PipelineError};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;

pub struct UdpFeed {
    socket: UdpSocket,
    pipeline: Arc<Pipeline>,
    shutdown: broadcast::Receiver<()>,
}

impl UdpFeed {
    pub fn new(socket: UdpSocket, pipeline: Arc<Pipeline>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            socket,
            pipeline,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("udp feed shutting down");
                    return Ok(());
                }

                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "udp receive failed");
                            continue;
                        }
                    };

                    let datagram = RawDatagram::new(Bytes::copy_from_slice(&buf[..len]), Some(peer));
                    let pipeline = self.pipeline.clone();
                    let result = tokio::task::block_in_place(move || pipeline.submit(datagram));

                    // Per-datagram failures are already counted and logged by
                    // the pipeline; only a stopped pipeline ends the feed.
                    if let Err(IngestError::Pipeline(PipelineError::NotRunning(state))) = result {
                        tracing::info!(%state, "pipeline no longer running, udp feed exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}
