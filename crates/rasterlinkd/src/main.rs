//! rasterlinkd: raster transfer over a lossy relay.
//!
//! One binary, three roles: `send` transmits an image once, `receive`
//! accepts transfers and writes the results, `relay` forwards traffic
//! between the two while injecting loss and noise.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use rasterlink_core::config::RasterLinkConfig;

mod receive;
mod relay;
mod send;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send one image through the relay, then exit.
    Send {
        /// PGM or PNG image to send. Defaults to `files.source_image`.
        image: Option<PathBuf>,
        /// Relay address. Defaults to `network.relay_addr`.
        #[arg(long)]
        relay: Option<String>,
    },
    /// Accept transfers forever, writing unfiltered and filtered images.
    Receive {
        /// Listen address. Defaults to `network.receiver_listen`.
        #[arg(long)]
        listen: Option<String>,
        /// Output directory. Defaults to `files.output_dir`.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Forward traffic to the receiver, dropping and corrupting chunks.
    Relay {
        /// Listen address. Defaults to `network.relay_listen`.
        #[arg(long)]
        listen: Option<String>,
        /// Receiver address. Defaults to `network.upstream`.
        #[arg(long)]
        upstream: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Load config
    if let Err(e) = RasterLinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = RasterLinkConfig::load()?;
    tracing::debug!(path = %RasterLinkConfig::file_path().display(), "config loaded");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match cli.mode {
        Mode::Send { image, relay } => {
            if let Some(image) = image {
                config.files.source_image = image;
            }
            if let Some(relay) = relay {
                config.network.relay_addr = relay;
            }
            send::run(&config, shutdown_tx.subscribe()).await
        }
        Mode::Receive { listen, output_dir } => {
            if let Some(listen) = listen {
                config.network.receiver_listen = listen;
            }
            if let Some(dir) = output_dir {
                config.files.output_dir = dir;
            }
            receive::run(&config, shutdown_tx.subscribe()).await
        }
        Mode::Relay { listen, upstream } => {
            if let Some(listen) = listen {
                config.network.relay_listen = listen;
            }
            if let Some(upstream) = upstream {
                config.network.upstream = upstream;
            }
            relay::run(&config, shutdown_tx.subscribe()).await
        }
    }
}
