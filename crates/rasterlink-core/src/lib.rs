//! rasterlink-core: wire format, message types, and configuration.
//! All other rasterlink crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Chunk, LossRequest, Message, RasterMetadata};
pub use wire::{Envelope, MessageType, WireError};
