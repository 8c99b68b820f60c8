//! Receiver state machine and the accept loop that drives it.
//!
//! `AwaitMetadata → CollectChunks → Evaluate → (RequestLoss → CollectChunks)* → Complete`

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use rasterlink_core::Message;

use super::{expect_message, send_message, TransferError, TransferSession};
use crate::connection::Connection;
use crate::filter::median_filter;
use crate::raster::Raster;

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct ReceivedRaster {
    pub raster: Raster,
    /// Collection passes, including the final one.
    pub rounds: u32,
    /// Chunk deliveries for indices already held.
    pub duplicates: u64,
}

enum Phase {
    AwaitMetadata,
    CollectChunks(TransferSession),
    Evaluate(TransferSession),
    RequestLoss(TransferSession),
    Complete(TransferSession),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitMetadata => "awaiting metadata",
            Phase::CollectChunks(_) => "collecting chunks",
            Phase::Evaluate(_) => "evaluating",
            Phase::RequestLoss(_) => "requesting loss",
            Phase::Complete(_) => "complete",
        }
    }
}

/// Run the receiving side of one transfer over `conn`.
pub async fn receive_raster<S>(
    conn: &mut Connection<S>,
    max_raster_bytes: u64,
) -> Result<ReceivedRaster, TransferError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut rounds = 0u32;
    let mut phase = Phase::AwaitMetadata;

    loop {
        tracing::debug!(peer = conn.peer(), phase = phase.name(), "receiver phase");
        phase = match phase {
            Phase::AwaitMetadata => match expect_message(conn, "awaiting metadata").await? {
                Message::Metadata(metadata) => {
                    let session = TransferSession::new(metadata, max_raster_bytes)?;
                    tracing::info!(
                        peer = conn.peer(),
                        width = metadata.width,
                        height = metadata.height,
                        chunks = session.expected_count(),
                        "transfer started"
                    );
                    Phase::CollectChunks(session)
                }
                other => return Err(TransferError::unexpected("awaiting metadata", &other)),
            },

            Phase::CollectChunks(mut session) => {
                loop {
                    match expect_message(conn, "collecting chunks").await? {
                        Message::Chunk(chunk) => {
                            let index = chunk.index;
                            if !session.accept_chunk(chunk)? {
                                tracing::trace!(index, "duplicate chunk");
                            }
                        }
                        Message::EndOfTransfer => break,
                        other => {
                            return Err(TransferError::unexpected("collecting chunks", &other))
                        }
                    }
                }
                Phase::Evaluate(session)
            }

            Phase::Evaluate(session) => {
                rounds += 1;
                tracing::debug!(
                    round = rounds,
                    received = session.received_count(),
                    missing = session.missing_count(),
                    "pass finished"
                );
                if session.is_complete() {
                    Phase::Complete(session)
                } else {
                    Phase::RequestLoss(session)
                }
            }

            Phase::RequestLoss(session) => {
                let request = Message::LossRequest(session.loss_request());
                send_message(conn, &request, "requesting loss").await?;
                Phase::CollectChunks(session)
            }

            Phase::Complete(session) => {
                // Everything is in hand; a failed acknowledgement does not
                // invalidate the raster.
                conn.send(&Message::EndOfTransfer).await?;
                if !conn.is_connected() {
                    tracing::warn!(peer = conn.peer(), "completion acknowledgement not delivered");
                }
                let duplicates = session.duplicates();
                let raster = session.assemble()?;
                tracing::info!(
                    peer = conn.peer(),
                    rounds,
                    duplicates,
                    digest = %hex::encode(raster.digest()),
                    "transfer complete"
                );
                return Ok(ReceivedRaster {
                    raster,
                    rounds,
                    duplicates,
                });
            }
        };
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

/// Accepts connections one at a time, runs a transfer on each, and writes
/// the unfiltered and median-filtered images on completion.
pub struct ReceiverService {
    listener: TcpListener,
    output_dir: PathBuf,
    unfiltered_name: String,
    filtered_name: String,
    max_raster_bytes: u64,
    receive_timeout: Option<Duration>,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiverService {
    pub fn new(
        listener: TcpListener,
        output_dir: PathBuf,
        unfiltered_name: String,
        filtered_name: String,
        max_raster_bytes: u64,
        receive_timeout: Option<Duration>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            output_dir,
            unfiltered_name,
            filtered_name,
            max_raster_bytes,
            receive_timeout,
            shutdown,
        }
    }

    pub fn unfiltered_path(&self) -> PathBuf {
        self.output_dir.join(&self.unfiltered_name)
    }

    pub fn filtered_path(&self) -> PathBuf {
        self.output_dir.join(&self.filtered_name)
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        tracing::info!(
            addr = %self.listener.local_addr()?,
            output_dir = %self.output_dir.display(),
            "receiver listening"
        );

        loop {
            let stream = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("receiver shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let mut conn = match Connection::from_tcp(stream) {
                Ok(conn) => conn.with_receive_timeout(self.receive_timeout),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to configure accepted stream");
                    continue;
                }
            };

            let result = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(peer = conn.peer(), "receiver shutting down mid-transfer");
                    return Ok(());
                }
                r = receive_raster(&mut conn, self.max_raster_bytes) => r,
            };
            conn.close().await;

            match result {
                Ok(received) => {
                    if let Err(e) = self.store(&received.raster) {
                        tracing::error!(error = %e, "failed to write received image");
                    }
                }
                Err(e) => tracing::warn!(peer = conn.peer(), error = %e, "transfer aborted"),
            }
        }
    }

    fn store(&self, raster: &Raster) -> Result<(), TransferError> {
        let unfiltered = self.unfiltered_path();
        let filtered = self.filtered_path();
        raster.write_image(&unfiltered)?;
        median_filter(raster).write_image(&filtered)?;
        tracing::info!(
            unfiltered = %unfiltered.display(),
            filtered = %filtered.display(),
            "images written"
        );
        Ok(())
    }
}
