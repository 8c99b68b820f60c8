//! `rasterlinkd relay`

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use rasterlink_core::config::RasterLinkConfig;
use rasterlink_services::{NoiseModel, Relay};

pub async fn run(config: &RasterLinkConfig, shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = &config.network.relay_listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;

    let noise = NoiseModel::new(config.relay.drop_probability, config.relay.noise_probability);
    if let Some(seed) = config.relay.seed {
        tracing::info!(seed, "relay randomness seeded");
    }
    let relay = Relay::new(config.network.upstream.clone(), noise, config.relay.seed)
        .with_receive_timeout(config.network.receive_timeout());

    Arc::new(relay)
        .run(listener, shutdown)
        .await
        .context("relay stopped")
}
