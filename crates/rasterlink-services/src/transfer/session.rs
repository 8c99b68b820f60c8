//! Receiver-side bookkeeping for one raster transfer.

use std::collections::HashMap;

use rasterlink_core::wire::{CHUNK_SIZE, MAX_LOSS_REQUEST_INDICES};
use rasterlink_core::{Chunk, LossRequest, RasterMetadata};

use super::TransferError;
use crate::raster::Raster;

/// Created when metadata arrives, dropped when the transfer completes or
/// the connection goes away. `received` only ever grows.
pub struct TransferSession {
    metadata: RasterMetadata,
    expected_count: u64,
    received: HashMap<u32, Vec<u8>>,
    duplicates: u64,
}

impl TransferSession {
    /// Rejects dimensions whose pixel count exceeds `max_raster_bytes`, or
    /// whose chunks cannot all be numbered by a u32 index.
    pub fn new(metadata: RasterMetadata, max_raster_bytes: u64) -> Result<Self, TransferError> {
        let pixels = metadata.pixel_count();
        let expected_count = metadata.chunk_count();
        if expected_count > u64::from(u32::MAX) + 1 {
            return Err(TransferError::violation(
                "awaiting metadata",
                format!(
                    "{}x{} raster needs {expected_count} chunks, more than a u32 index can address",
                    metadata.width, metadata.height
                ),
            ));
        }
        if pixels > max_raster_bytes {
            return Err(TransferError::violation(
                "awaiting metadata",
                format!(
                    "{}x{} raster is {pixels} bytes, limit is {max_raster_bytes}",
                    metadata.width, metadata.height
                ),
            ));
        }
        Ok(Self {
            metadata,
            expected_count,
            received: HashMap::new(),
            duplicates: 0,
        })
    }

    pub fn metadata(&self) -> RasterMetadata {
        self.metadata
    }

    pub fn expected_count(&self) -> u64 {
        self.expected_count
    }

    pub fn received_count(&self) -> u64 {
        self.received.len() as u64
    }

    /// Deliveries of an index that had already arrived.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Pixel length chunk `index` must carry.
    fn expected_len(&self, index: u32) -> usize {
        let last = self.expected_count - 1;
        if u64::from(index) < last {
            CHUNK_SIZE
        } else {
            (self.metadata.pixel_count() - last * CHUNK_SIZE as u64) as usize
        }
    }

    /// Store a chunk, replacing any earlier copy of the same index.
    /// Returns `true` the first time an index arrives.
    pub fn accept_chunk(&mut self, chunk: Chunk) -> Result<bool, TransferError> {
        const PHASE: &str = "collecting chunks";

        if u64::from(chunk.index) >= self.expected_count {
            return Err(TransferError::violation(
                PHASE,
                format!(
                    "chunk #{} outside 0..{}",
                    chunk.index, self.expected_count
                ),
            ));
        }
        let expected = self.expected_len(chunk.index);
        if chunk.pixels.len() != expected {
            return Err(TransferError::violation(
                PHASE,
                format!(
                    "chunk #{} carries {} bytes, expected {expected}",
                    chunk.index,
                    chunk.pixels.len()
                ),
            ));
        }

        let fresh = self.received.insert(chunk.index, chunk.pixels).is_none();
        if !fresh {
            self.duplicates += 1;
        }
        Ok(fresh)
    }

    pub fn missing_count(&self) -> u64 {
        self.expected_count - self.received.len() as u64
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.expected_count)
            .map(|i| i as u32)
            .filter(|i| !self.received.contains_key(i))
    }

    /// The first [`MAX_LOSS_REQUEST_INDICES`] missing indices.
    pub fn loss_request(&self) -> LossRequest {
        LossRequest {
            indices: self.missing().take(MAX_LOSS_REQUEST_INDICES).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Concatenate chunks in index order into the finished raster.
    pub fn assemble(mut self) -> Result<Raster, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::violation(
                "assembling",
                format!("{} chunks still missing", self.missing_count()),
            ));
        }
        let mut pixels = Vec::with_capacity(self.metadata.pixel_count() as usize);
        for index in 0..self.expected_count {
            if let Some(part) = self.received.remove(&(index as u32)) {
                pixels.extend_from_slice(&part);
            }
        }
        Ok(Raster::new(
            self.metadata.width,
            self.metadata.height,
            pixels,
        )?)
    }
}
