//! Relay: a lossy proxy between a sender and one fixed upstream.
//!
//! Each accepted connection gets its own outbound connection and two
//! forwarding tasks, one per direction. A task exclusively owns the reader
//! half of its source and the writer half of its sink. When either task
//! ends it signals the link's done channel; the sibling observes that at
//! its next receive and ends too. Process shutdown is observed the same
//! way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::connection::{Connection, MessageReader, MessageWriter};
use crate::noise::{rng_for, NoiseModel, NoiseOutcome};

/// One open link, as seen from outside.
#[derive(Debug, Clone)]
pub struct RelayLink {
    pub id: u64,
    pub inbound: String,
    pub upstream: String,
    pub opened_at: Instant,
}

/// Open links, keyed by link id.
pub type LinkTable = Arc<DashMap<u64, RelayLink>>;

pub fn new_link_table() -> LinkTable {
    Arc::new(DashMap::new())
}

/// Counters for one direction of one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub dropped: u64,
    /// Pixel bytes zeroed across all forwarded chunks.
    pub zeroed: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

pub struct Relay {
    upstream: String,
    noise: NoiseModel,
    seed: Option<u64>,
    receive_timeout: Option<Duration>,
    links: LinkTable,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(upstream: impl Into<String>, noise: NoiseModel, seed: Option<u64>) -> Self {
        Self {
            upstream: upstream.into(),
            noise,
            seed,
            receive_timeout: None,
            links: new_link_table(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Accept until `shutdown` fires. Every link also observes `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            upstream = %self.upstream,
            drop_probability = self.noise.drop_probability(),
            noise_probability = self.noise.noise_probability(),
            "relay listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(open_links = self.links.len(), "relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let relay = self.clone();
                        let shutdown = shutdown.resubscribe();
                        tokio::spawn(async move { relay.handle_link(stream, shutdown).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
    }

    async fn handle_link(&self, stream: TcpStream, shutdown: broadcast::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let inbound = match Connection::from_tcp(stream) {
            Ok(conn) => conn.with_receive_timeout(self.receive_timeout),
            Err(e) => {
                tracing::warn!(link = id, error = %e, "failed to configure accepted stream");
                return;
            }
        };
        let outbound = match Connection::connect(self.upstream.as_str()).await {
            Ok(conn) => conn.with_receive_timeout(self.receive_timeout),
            Err(e) => {
                tracing::warn!(
                    link = id,
                    inbound = inbound.peer(),
                    upstream = %self.upstream,
                    error = %e,
                    "upstream unreachable, dropping inbound connection"
                );
                return;
            }
        };

        self.links.insert(
            id,
            RelayLink {
                id,
                inbound: inbound.peer().to_string(),
                upstream: outbound.peer().to_string(),
                opened_at: Instant::now(),
            },
        );
        tracing::info!(link = id, inbound = inbound.peer(), upstream = outbound.peer(), "link open");

        let (inbound_reader, inbound_writer) = inbound.into_split();
        let (outbound_reader, outbound_writer) = outbound.into_split();
        let (done, _) = broadcast::channel::<()>(1);

        let up = Forwarder {
            link: id,
            direction: Direction::Upstream,
            noise: self.noise,
            rng: rng_for(self.seed, id.wrapping_mul(2)),
            done: done.clone(),
        };
        let down = Forwarder {
            link: id,
            direction: Direction::Downstream,
            noise: self.noise,
            rng: rng_for(self.seed, id.wrapping_mul(2).wrapping_add(1)),
            done: done.clone(),
        };

        let up_task = tokio::spawn(up.run(
            inbound_reader,
            outbound_writer,
            done.subscribe(),
            shutdown.resubscribe(),
        ));
        let down_task = tokio::spawn(down.run(
            outbound_reader,
            inbound_writer,
            done.subscribe(),
            shutdown,
        ));
        drop(done);

        let (up_stats, down_stats) = tokio::join!(up_task, down_task);
        let up_stats = up_stats.unwrap_or_default();
        let down_stats = down_stats.unwrap_or_default();

        let opened_at = self.links.remove(&id).map(|(_, link)| link.opened_at);
        tracing::info!(
            link = id,
            open_secs = opened_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or_default(),
            up_forwarded = up_stats.forwarded,
            up_dropped = up_stats.dropped,
            up_zeroed = up_stats.zeroed,
            down_forwarded = down_stats.forwarded,
            down_dropped = down_stats.dropped,
            down_zeroed = down_stats.zeroed,
            "link closed"
        );
    }
}

/// One direction of a link.
struct Forwarder {
    link: u64,
    direction: Direction,
    noise: NoiseModel,
    rng: StdRng,
    done: broadcast::Sender<()>,
}

impl Forwarder {
    async fn run<R, W>(
        mut self,
        mut source: MessageReader<R>,
        mut sink: MessageWriter<W>,
        mut sibling_done: broadcast::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ForwardStats
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = ForwardStats::default();
        let direction = self.direction.as_str();

        loop {
            let received = tokio::select! {
                _ = sibling_done.recv() => {
                    tracing::debug!(link = self.link, direction, "sibling finished");
                    break;
                }
                _ = shutdown.recv() => break,
                r = source.receive() => r,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::debug!(link = self.link, direction, peer = source.peer(), "source closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(link = self.link, direction, error = %e, "undecodable traffic, closing link");
                    break;
                }
            };

            match self.noise.apply(message, &mut self.rng) {
                NoiseOutcome::Dropped => {
                    stats.dropped += 1;
                    tracing::trace!(link = self.link, direction, "chunk dropped");
                }
                NoiseOutcome::Forward { message, zeroed } => {
                    if let Err(e) = sink.send(&message).await {
                        tracing::warn!(link = self.link, direction, error = %e, "unencodable message");
                        break;
                    }
                    if !sink.is_connected() {
                        break;
                    }
                    stats.forwarded += 1;
                    stats.zeroed += zeroed as u64;
                }
            }
        }

        sink.close().await;
        let _ = self.done.send(());
        stats
    }
}
