//! Chunked raster transfer with loss-request recovery.
//!
//! The sender pushes metadata, every chunk, and an end-of-transfer
//! marker. The receiver answers each pass with either a loss request
//! (at most [`MAX_LOSS_REQUEST_INDICES`] missing indices, ascending) or
//! end-of-transfer once nothing is missing. Rounds are unbounded.
//!
//! [`MAX_LOSS_REQUEST_INDICES`]: rasterlink_core::wire::MAX_LOSS_REQUEST_INDICES

pub mod receiver;
pub mod sender;
pub mod session;

pub use receiver::{receive_raster, ReceivedRaster, ReceiverService};
pub use sender::{send_raster, send_to, SendReport, SenderOptions};
pub use session::TransferSession;

use rasterlink_core::{Message, WireError};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::Connection;
use crate::raster::RasterError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connection to peer lost while {phase}")]
    Transport { phase: &'static str },
    #[error("protocol violation while {phase}: {reason}")]
    ProtocolViolation { phase: &'static str, reason: String },
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("undecodable envelope: {0}")]
    MalformedPayload(WireError),
    #[error(transparent)]
    Raster(#[from] RasterError),
}

impl TransferError {
    pub(crate) fn violation(phase: &'static str, reason: impl Into<String>) -> Self {
        TransferError::ProtocolViolation {
            phase,
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected(phase: &'static str, message: &Message) -> Self {
        Self::violation(phase, format!("unexpected {message}"))
    }
}

impl From<WireError> for TransferError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::UnknownMessageType(id) => TransferError::UnknownMessageType(id),
            other => TransferError::MalformedPayload(other),
        }
    }
}

/// Receive the next message, turning "no message" into a transport error
/// attributed to `phase`.
pub(crate) async fn expect_message<S>(
    conn: &mut Connection<S>,
    phase: &'static str,
) -> Result<Message, TransferError>
where
    S: AsyncRead + AsyncWrite,
{
    conn.receive()
        .await?
        .ok_or(TransferError::Transport { phase })
}

/// Send, then confirm the connection survived the write.
pub(crate) async fn send_message<S>(
    conn: &mut Connection<S>,
    message: &Message,
    phase: &'static str,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite,
{
    conn.send(message).await?;
    if conn.is_connected() {
        Ok(())
    } else {
        Err(TransferError::Transport { phase })
    }
}
