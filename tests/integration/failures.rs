use crate::*;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rasterlink_core::{Message, RasterMetadata};
use rasterlink_services::{send_to, Connection, NoiseModel, SenderOptions, TransferError};
use tokio::io::AsyncWriteExt;

// ══════════════════════════════════════════════════════════════════════════════
//  Disconnects, deadlines, and hostile peers
// ══════════════════════════════════════════════════════════════════════════════

/// A relay whose upstream refuses connections hangs up on the sender.
#[tokio::test]
async fn test_unreachable_upstream_fails_the_sender() -> Result<()> {
    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = closed.local_addr()?;
    drop(closed);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = listener.local_addr()?.to_string();
    let relay = Arc::new(Relay::new(dead_addr.to_string(), NoiseModel::lossless(), None));
    let (shutdown, _) = broadcast::channel::<()>(1);
    tokio::spawn(relay.clone().run(listener, shutdown.subscribe()));

    let mut rng = StdRng::seed_from_u64(10);
    let options = SenderOptions {
        resend_drop_probability: 0.0,
        receive_timeout: Some(Duration::from_secs(5)),
    };
    let err = send_to(&relay_addr, &test_image(64, 64), &options, &mut rng)
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransferError::Transport { .. }),
        "expected transport failure, got {err}"
    );
    assert!(relay.links().is_empty());

    let _ = shutdown.send(());
    Ok(())
}

/// A peer that never answers trips the receive deadline.
#[tokio::test]
async fn test_silent_receiver_trips_deadline() -> Result<()> {
    // Accepts and holds the connection without ever replying.
    let silent = TcpListener::bind("127.0.0.1:0").await?;
    let silent_addr = silent.local_addr()?;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut rng = StdRng::seed_from_u64(11);
    let options = SenderOptions {
        resend_drop_probability: 0.0,
        receive_timeout: Some(Duration::from_millis(300)),
    };
    let err = send_to(&silent_addr.to_string(), &test_image(32, 32), &options, &mut rng)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Transport {
            phase: "awaiting reply"
        }
    ));
    Ok(())
}

/// Garbage on one connection aborts only that transfer.
#[tokio::test]
async fn test_receiver_survives_undecodable_client() -> Result<()> {
    let stack = Stack::start("garbage", NoiseModel::lossless(), 12).await?;

    let mut raw = tokio::net::TcpStream::connect(stack.receiver_addr).await?;
    raw.write_all(&[0x7F, 0, 0, 0, 0]).await?;
    let mut probe = Connection::from_tcp(raw)?;
    assert_eq!(probe.receive().await?, None, "receiver should hang up");

    let image = test_image(48, 48);
    let mut rng = StdRng::seed_from_u64(12);
    let options = SenderOptions {
        resend_drop_probability: 0.0,
        receive_timeout: Some(Duration::from_secs(10)),
    };
    send_to(&stack.relay_addr.to_string(), &image, &options, &mut rng).await?;

    let (unfiltered, _) = stack.wait_for_output().await?;
    assert_eq!(unfiltered, image);
    Ok(())
}

/// Metadata announcing more pixels than the receiver allows is refused.
#[tokio::test]
async fn test_receiver_refuses_oversized_raster() -> Result<()> {
    let stack = Stack::start("oversized", NoiseModel::lossless(), 13).await?;

    let mut conn = Connection::connect(stack.receiver_addr).await?;
    conn.send(&Message::Metadata(RasterMetadata {
        width: 65_536,
        height: 65_536,
    }))
    .await?;
    assert_eq!(conn.receive().await?, None);
    assert!(!stack.filtered().exists());
    Ok(())
}

/// A sender that disappears mid-transfer leaves no partial image behind.
#[tokio::test]
async fn test_abandoned_transfer_writes_nothing() -> Result<()> {
    let stack = Stack::start("abandoned", NoiseModel::lossless(), 14).await?;
    let image = test_image(64, 64);

    {
        let mut conn = Connection::connect(stack.relay_addr).await?;
        conn.send(&Message::Metadata(image.metadata())).await?;
        for chunk in image.to_chunks().into_iter().take(3) {
            conn.send(&Message::Chunk(chunk)).await?;
        }
    }

    stack.wait_for_idle_relay().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stack.unfiltered().exists());
    assert!(!stack.filtered().exists());
    Ok(())
}
