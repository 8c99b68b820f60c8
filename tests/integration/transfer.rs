use crate::*;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rasterlink_services::{median_filter, send_to, NoiseModel, SenderOptions};

// ══════════════════════════════════════════════════════════════════════════════
//  End-to-end transfers: sender → relay → receiver
// ══════════════════════════════════════════════════════════════════════════════

fn options(resend_drop_probability: f64) -> SenderOptions {
    SenderOptions {
        resend_drop_probability,
        receive_timeout: Some(Duration::from_secs(10)),
    }
}

/// A transparent relay delivers everything on the first pass.
#[tokio::test]
async fn test_lossless_transfer_is_bit_exact() -> Result<()> {
    let stack = Stack::start("lossless", NoiseModel::lossless(), 1).await?;
    let image = test_image(256, 256);

    let mut rng = StdRng::seed_from_u64(1);
    let report = send_to(&stack.relay_addr.to_string(), &image, &options(0.0), &mut rng).await?;
    assert_eq!(report.chunks, 128);
    assert_eq!(report.rounds, 1);
    assert_eq!(report.resent, 0);

    let (unfiltered, filtered) = stack.wait_for_output().await?;
    assert_eq!(unfiltered, image);
    assert_eq!(filtered, median_filter(&image));

    stack.wait_for_idle_relay().await?;
    Ok(())
}

/// Dropped chunks are requested again until every index has arrived.
/// Without corruption the result is still exact.
#[tokio::test]
async fn test_dropped_chunks_are_recovered() -> Result<()> {
    let stack = Stack::start("drops", NoiseModel::new(0.3, 0.0), 2).await?;
    let image = test_image(256, 256);

    let mut rng = StdRng::seed_from_u64(2);
    let report = send_to(&stack.relay_addr.to_string(), &image, &options(0.0), &mut rng).await?;
    assert!(report.rounds >= 2, "expected recovery rounds, got {report:?}");
    assert!(report.resent > 0);

    let (unfiltered, _) = stack.wait_for_output().await?;
    assert_eq!(unfiltered, image);
    Ok(())
}

/// Relay loss and uplink loss compound; the transfer still converges.
#[tokio::test]
async fn test_uplink_and_relay_loss_compound() -> Result<()> {
    let stack = Stack::start("double-drop", NoiseModel::new(0.2, 0.0), 3).await?;
    let image = test_image(128, 128);

    let mut rng = StdRng::seed_from_u64(3);
    let report = send_to(&stack.relay_addr.to_string(), &image, &options(0.5), &mut rng).await?;
    assert!(report.suppressed > 0, "uplink loss never fired: {report:?}");

    let (unfiltered, _) = stack.wait_for_output().await?;
    assert_eq!(unfiltered, image);
    Ok(())
}

/// With pixel noise the image arrives complete but not intact.
#[tokio::test]
async fn test_noisy_transfer_keeps_dimensions() -> Result<()> {
    let stack = Stack::start("noisy", NoiseModel::default(), 4).await?;
    let image = test_image(256, 256);

    let mut rng = StdRng::seed_from_u64(4);
    send_to(&stack.relay_addr.to_string(), &image, &options(0.05), &mut rng).await?;

    let (unfiltered, filtered) = stack.wait_for_output().await?;
    assert_eq!((unfiltered.width(), unfiltered.height()), (256, 256));
    assert_eq!((filtered.width(), filtered.height()), (256, 256));
    assert_ne!(unfiltered, image, "noise should have zeroed some pixels");
    Ok(())
}

/// The receiver keeps accepting; each completed transfer replaces the
/// previous outputs.
#[tokio::test]
async fn test_consecutive_transfers_replace_outputs() -> Result<()> {
    let stack = Stack::start("consecutive", NoiseModel::lossless(), 5).await?;
    let relay = stack.relay_addr.to_string();
    let mut rng = StdRng::seed_from_u64(5);

    let first = test_image(64, 32);
    send_to(&relay, &first, &options(0.0), &mut rng).await?;
    let (unfiltered, _) = stack.wait_for_output().await?;
    assert_eq!(unfiltered, first);

    let second = test_image(100, 10);
    send_to(&relay, &second, &options(0.0), &mut rng).await?;

    for _ in 0..250 {
        let (unfiltered, _) = stack.wait_for_output().await?;
        if unfiltered == second {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("second transfer never replaced the first")
}

/// A zero-pixel image is a valid, immediately complete transfer.
#[tokio::test]
async fn test_empty_image_transfers() -> Result<()> {
    let stack = Stack::start("empty", NoiseModel::default(), 6).await?;
    let image = Raster::new(0, 0, Vec::new())?;

    let mut rng = StdRng::seed_from_u64(6);
    let report = send_to(&stack.relay_addr.to_string(), &image, &options(0.0), &mut rng).await?;
    assert_eq!(report.chunks, 0);
    assert_eq!(report.rounds, 1);

    let (unfiltered, _) = stack.wait_for_output().await?;
    assert!(unfiltered.pixels().is_empty());
    Ok(())
}
