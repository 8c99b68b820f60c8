//! `rasterlinkd send`

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use rasterlink_core::config::RasterLinkConfig;
use rasterlink_services::{rng_for, send_to, Raster, SenderOptions};

/// RNG stream reserved for the sender's uplink loss.
const SENDER_RNG_STREAM: u64 = u64::MAX;

pub async fn run(config: &RasterLinkConfig, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let path = &config.files.source_image;
    let raster = Raster::read_image(path)
        .with_context(|| format!("failed to load source image {}", path.display()))?;
    tracing::info!(
        image = %path.display(),
        width = raster.width(),
        height = raster.height(),
        relay = %config.network.relay_addr,
        "sending"
    );

    let options = SenderOptions {
        resend_drop_probability: config.transfer.resend_drop_probability,
        receive_timeout: config.network.receive_timeout(),
    };
    let mut rng = rng_for(config.relay.seed, SENDER_RNG_STREAM);

    tokio::select! {
        _ = shutdown.recv() => anyhow::bail!("interrupted before the transfer completed"),
        result = send_to(&config.network.relay_addr, &raster, &options, &mut rng) => {
            let report = result.context("transfer failed")?;
            tracing::info!(
                rounds = report.rounds,
                resent = report.resent,
                suppressed = report.suppressed,
                "done"
            );
            Ok(())
        }
    }
}
