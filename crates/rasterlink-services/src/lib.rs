//! rasterlink-services: connections, the transfer protocol, and the relay.

pub mod connection;
pub mod filter;
pub mod noise;
pub mod raster;
pub mod relay;
pub mod transfer;

pub use connection::{Connection, MessageReader, MessageWriter};
pub use filter::median_filter;
pub use noise::{rng_for, NoiseModel, NoiseOutcome};
pub use raster::{Raster, RasterError};
pub use relay::{ForwardStats, LinkTable, Relay, RelayLink};
pub use transfer::{
    receive_raster, send_raster, send_to, ReceivedRaster, ReceiverService, SendReport,
    SenderOptions, TransferError, TransferSession,
};
