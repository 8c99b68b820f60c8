//! Sender state machine.
//!
//! `SendMetadata → SendChunks → AwaitReply → (Resend → AwaitReply)* → Done`

use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use rasterlink_core::{LossRequest, Message};

use super::{expect_message, send_message, TransferError};
use crate::connection::Connection;
use crate::noise::clamp_probability;
use crate::raster::Raster;

/// Outcome of a completed send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Chunks in the raster.
    pub chunks: u64,
    /// Replies awaited, including the final acknowledgement.
    pub rounds: u32,
    /// Chunks written again in answer to loss requests.
    pub resent: u64,
    /// Requested resends skipped by the simulated uplink loss.
    pub suppressed: u64,
}

#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Probability each requested resend is silently skipped.
    pub resend_drop_probability: f64,
    pub receive_timeout: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            resend_drop_probability: 0.05,
            receive_timeout: None,
        }
    }
}

enum Phase {
    SendMetadata,
    SendChunks,
    AwaitReply,
    Resend(LossRequest),
    Done,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::SendMetadata => "sending metadata",
            Phase::SendChunks => "sending chunks",
            Phase::AwaitReply => "awaiting reply",
            Phase::Resend(_) => "resending",
            Phase::Done => "done",
        }
    }
}

/// Run one transfer of `raster` over `conn`.
///
/// Returns once the receiver acknowledges completion with end-of-transfer.
pub async fn send_raster<S, G>(
    conn: &mut Connection<S>,
    raster: &Raster,
    resend_drop_probability: f64,
    rng: &mut G,
) -> Result<SendReport, TransferError>
where
    S: AsyncRead + AsyncWrite,
    G: Rng,
{
    let drop_probability = clamp_probability(resend_drop_probability);
    let chunks = raster.to_chunks();
    let mut report = SendReport {
        chunks: chunks.len() as u64,
        ..SendReport::default()
    };
    let mut phase = Phase::SendMetadata;

    loop {
        tracing::debug!(peer = conn.peer(), phase = phase.name(), "sender phase");
        phase = match phase {
            Phase::SendMetadata => {
                let metadata = raster.metadata();
                send_message(conn, &Message::Metadata(metadata), "sending metadata").await?;
                Phase::SendChunks
            }

            Phase::SendChunks => {
                for chunk in &chunks {
                    send_message(conn, &Message::Chunk(chunk.clone()), "sending chunks").await?;
                }
                send_message(conn, &Message::EndOfTransfer, "sending chunks").await?;
                Phase::AwaitReply
            }

            Phase::AwaitReply => {
                report.rounds += 1;
                match expect_message(conn, "awaiting reply").await? {
                    Message::EndOfTransfer => Phase::Done,
                    Message::LossRequest(request) => Phase::Resend(request),
                    other => return Err(TransferError::unexpected("awaiting reply", &other)),
                }
            }

            Phase::Resend(request) => {
                tracing::debug!(
                    peer = conn.peer(),
                    requested = request.indices.len(),
                    round = report.rounds,
                    "loss request"
                );
                for index in request.indices {
                    let chunk = chunks.get(index as usize).ok_or_else(|| {
                        TransferError::violation(
                            "resending",
                            format!("loss request names chunk #{index} of {}", chunks.len()),
                        )
                    })?;
                    if rng.gen_bool(drop_probability) {
                        report.suppressed += 1;
                        continue;
                    }
                    send_message(conn, &Message::Chunk(chunk.clone()), "resending").await?;
                    report.resent += 1;
                }
                send_message(conn, &Message::EndOfTransfer, "resending").await?;
                Phase::AwaitReply
            }

            Phase::Done => {
                tracing::info!(
                    peer = conn.peer(),
                    width = raster.width(),
                    height = raster.height(),
                    chunks = report.chunks,
                    rounds = report.rounds,
                    resent = report.resent,
                    suppressed = report.suppressed,
                    digest = %hex::encode(raster.digest()),
                    "transfer acknowledged"
                );
                return Ok(report);
            }
        };
    }
}

/// Connect to `addr` and send `raster` once.
pub async fn send_to<G: Rng>(
    addr: &str,
    raster: &Raster,
    options: &SenderOptions,
    rng: &mut G,
) -> Result<SendReport, TransferError> {
    let mut conn = Connection::connect(addr)
        .await
        .map_err(|source| TransferError::Connect {
            addr: addr.to_string(),
            source,
        })?
        .with_receive_timeout(options.receive_timeout);

    tracing::info!(peer = conn.peer(), chunks = raster.chunk_count(), "connected, sending");
    let result = send_raster(&mut conn, raster, options.resend_drop_probability, rng).await;
    conn.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rasterlink_core::{Chunk, RasterMetadata};
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(1 << 20);
        (Connection::new(a, "sender"), Connection::new(b, "peer"))
    }

    fn raster(width: u32, height: u32) -> Raster {
        let pixels = (0..width * height).map(|i| (i * 7) as u8).collect();
        Raster::new(width, height, pixels).unwrap()
    }

    async fn drain_pass(peer: &mut Connection<DuplexStream>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        loop {
            match peer.receive().await.unwrap().unwrap() {
                Message::Chunk(c) => chunks.push(c),
                Message::EndOfTransfer => return chunks,
                other => panic!("unexpected {other}"),
            }
        }
    }

    #[tokio::test]
    async fn sends_metadata_then_chunks_then_marker() {
        let (mut conn, mut peer) = pair();
        let image = raster(100, 10);

        let peer_task = tokio::spawn(async move {
            let meta = peer.receive().await.unwrap().unwrap();
            let chunks = drain_pass(&mut peer).await;
            peer.send(&Message::EndOfTransfer).await.unwrap();
            (meta, chunks)
        });

        let mut rng = StdRng::seed_from_u64(1);
        let report = send_raster(&mut conn, &image, 0.0, &mut rng).await.unwrap();
        let (meta, chunks) = peer_task.await.unwrap();

        assert_eq!(
            meta,
            Message::Metadata(RasterMetadata {
                width: 100,
                height: 10
            })
        );
        assert_eq!(chunks, image.to_chunks());
        assert_eq!(
            report,
            SendReport {
                chunks: 2,
                rounds: 1,
                resent: 0,
                suppressed: 0
            }
        );
    }

    #[tokio::test]
    async fn resends_exactly_the_requested_chunks() {
        let (mut conn, mut peer) = pair();
        let image = raster(512, 6);

        let peer_task = tokio::spawn(async move {
            peer.receive().await.unwrap();
            drain_pass(&mut peer).await;
            peer.send(&Message::LossRequest(LossRequest {
                indices: vec![4, 1],
            }))
            .await
            .unwrap();
            let resent = drain_pass(&mut peer).await;
            peer.send(&Message::EndOfTransfer).await.unwrap();
            resent
        });

        let mut rng = StdRng::seed_from_u64(2);
        let report = send_raster(&mut conn, &image, 0.0, &mut rng).await.unwrap();
        let resent = peer_task.await.unwrap();

        assert_eq!(
            resent.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![4, 1]
        );
        assert_eq!(report.rounds, 2);
        assert_eq!(report.resent, 2);
    }

    #[tokio::test]
    async fn certain_uplink_loss_suppresses_every_resend() {
        let (mut conn, mut peer) = pair();
        let image = raster(512, 3);

        let peer_task = tokio::spawn(async move {
            peer.receive().await.unwrap();
            drain_pass(&mut peer).await;
            peer.send(&Message::LossRequest(LossRequest {
                indices: vec![0, 1, 2],
            }))
            .await
            .unwrap();
            let resent = drain_pass(&mut peer).await;
            peer.send(&Message::EndOfTransfer).await.unwrap();
            resent
        });

        let mut rng = StdRng::seed_from_u64(3);
        let report = send_raster(&mut conn, &image, 1.0, &mut rng).await.unwrap();
        assert!(peer_task.await.unwrap().is_empty());
        assert_eq!(report.suppressed, 3);
        assert_eq!(report.resent, 0);
    }

    #[tokio::test]
    async fn out_of_range_loss_request_is_violation() {
        let (mut conn, mut peer) = pair();
        let image = raster(10, 10);

        tokio::spawn(async move {
            peer.receive().await.unwrap();
            drain_pass(&mut peer).await;
            peer.send(&Message::LossRequest(LossRequest { indices: vec![9] }))
                .await
                .unwrap();
            // hold the stream open until the sender gives up
            let _ = peer.receive().await;
        });

        let mut rng = StdRng::seed_from_u64(4);
        let err = send_raster(&mut conn, &image, 0.0, &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn unexpected_reply_is_violation() {
        let (mut conn, mut peer) = pair();
        let image = raster(4, 4);

        tokio::spawn(async move {
            peer.receive().await.unwrap();
            drain_pass(&mut peer).await;
            peer.send(&Message::Metadata(RasterMetadata {
                width: 1,
                height: 1,
            }))
            .await
            .unwrap();
            let _ = peer.receive().await;
        });

        let mut rng = StdRng::seed_from_u64(5);
        let err = send_raster(&mut conn, &image, 0.0, &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::ProtocolViolation {
                phase: "awaiting reply",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn peer_hangup_is_transport_error() {
        let (mut conn, mut peer) = pair();
        let image = raster(4, 4);

        tokio::spawn(async move {
            peer.receive().await.unwrap();
            drain_pass(&mut peer).await;
            drop(peer);
        });

        let mut rng = StdRng::seed_from_u64(6);
        let err = send_raster(&mut conn, &image, 0.0, &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport {
                phase: "awaiting reply"
            }
        ));
    }
}
