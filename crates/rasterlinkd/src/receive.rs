//! `rasterlinkd receive`

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use rasterlink_core::config::RasterLinkConfig;
use rasterlink_services::ReceiverService;

pub async fn run(config: &RasterLinkConfig, shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = &config.network.receiver_listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind receiver on {addr}"))?;

    let service = ReceiverService::new(
        listener,
        config.files.output_dir.clone(),
        config.files.unfiltered_name.clone(),
        config.files.filtered_name.clone(),
        config.transfer.max_raster_bytes,
        config.network.receive_timeout(),
        shutdown,
    );
    service.run().await.context("receiver stopped")
}
