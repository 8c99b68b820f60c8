//! rasterlink integration test harness.
//!
//! Every test stands up a receiver and a relay on loopback ports chosen by
//! the OS, sends through the relay, and inspects what the receiver wrote.
//!
//!   cargo test --test integration
//!
//! Output goes to a per-test directory under the system temp dir.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use rasterlink_services::{NoiseModel, Raster, ReceiverService, Relay};

mod failures;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const UNFILTERED: &str = "unfiltered.pgm";
pub const FILTERED: &str = "filtered.pgm";

static NEXT_DIR: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty output directory for one test.
pub fn temp_dir(label: &str) -> PathBuf {
    let id = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "rasterlink-it-{label}-{}-{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Deterministic test image with enough structure to notice corruption.
pub fn test_image(width: u32, height: u32) -> Raster {
    let pixels = (0..height)
        .flat_map(|y| (0..width).map(move |x| ((x * 3 + y * 5) % 256) as u8))
        .collect();
    Raster::new(width, height, pixels).expect("dimensions match buffer")
}

/// A receiver and a relay in front of it.
pub struct Stack {
    pub relay_addr: SocketAddr,
    pub receiver_addr: SocketAddr,
    pub relay: Arc<Relay>,
    pub output_dir: PathBuf,
    shutdown: broadcast::Sender<()>,
}

impl Stack {
    pub async fn start(label: &str, noise: NoiseModel, seed: u64) -> Result<Self> {
        let output_dir = temp_dir(label);
        let (shutdown, _) = broadcast::channel::<()>(1);

        let receiver_listener = TcpListener::bind("127.0.0.1:0").await?;
        let receiver_addr = receiver_listener.local_addr()?;
        let receiver = ReceiverService::new(
            receiver_listener,
            output_dir.clone(),
            UNFILTERED.to_string(),
            FILTERED.to_string(),
            64 * 1024 * 1024,
            Some(Duration::from_secs(10)),
            shutdown.subscribe(),
        );
        tokio::spawn(receiver.run());

        let relay_listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay_addr = relay_listener.local_addr()?;
        let relay = Arc::new(
            Relay::new(receiver_addr.to_string(), noise, Some(seed))
                .with_receive_timeout(Some(Duration::from_secs(10))),
        );
        tokio::spawn(relay.clone().run(relay_listener, shutdown.subscribe()));

        Ok(Self {
            relay_addr,
            receiver_addr,
            relay,
            output_dir,
            shutdown,
        })
    }

    pub fn unfiltered(&self) -> PathBuf {
        self.output_dir.join(UNFILTERED)
    }

    pub fn filtered(&self) -> PathBuf {
        self.output_dir.join(FILTERED)
    }

    /// The receiver writes after acknowledging; poll until both images exist.
    pub async fn wait_for_output(&self) -> Result<(Raster, Raster)> {
        for _ in 0..250 {
            if self.filtered().exists() {
                let unfiltered = Raster::read_image(&self.unfiltered())
                    .context("reading unfiltered output")?;
                let filtered =
                    Raster::read_image(&self.filtered()).context("reading filtered output")?;
                return Ok((unfiltered, filtered));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bail!("receiver never wrote {}", self.filtered().display())
    }

    /// Wait for every relay link to close.
    pub async fn wait_for_idle_relay(&self) -> Result<()> {
        for _ in 0..250 {
            if self.relay.links().is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bail!("{} relay links still open", self.relay.links().len())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.output_dir);
    }
}
