//! Raster: a row-major grayscale image, one byte per pixel.
//!
//! Images on disk are binary PGM (`P5`, maxval ≤ 255) or PNG, chosen by
//! file extension. PNG input of any colour type is reduced to 8-bit luma.
//! This module also owns splitting a pixel buffer into transfer chunks.

use std::path::Path;

use rasterlink_core::message::chunk_count;
use rasterlink_core::wire::CHUNK_SIZE;
use rasterlink_core::{Chunk, RasterMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("pixel buffer holds {actual} bytes, {width}x{height} needs {expected}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        expected: u64,
        actual: usize,
    },
    #[error("not a binary PGM image: {0}")]
    BadFormat(String),
    #[error("unsupported maxval {0} (only 8-bit images)")]
    UnsupportedDepth(u32),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("PNG codec failed on {path}: {source}")]
    Png {
        path: String,
        source: image::ImageError,
    },
}

impl Raster {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, RasterError> {
        let expected = u64::from(width) * u64::from(height);
        if pixels.len() as u64 != expected {
            return Err(RasterError::DimensionMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Same dimensions, replacement pixels of equal length.
    pub(crate) fn with_pixels(&self, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), self.pixels.len());
        Self {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    /// Pixel at (x, y). Callers keep coordinates in bounds.
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn metadata(&self) -> RasterMetadata {
        RasterMetadata {
            width: self.width,
            height: self.height,
        }
    }

    /// BLAKE3 digest of the pixel buffer.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.pixels).as_bytes()
    }

    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.pixels.len() as u64)
    }

    /// Split into chunks `0..chunk_count()` in transfer order.
    /// Every chunk holds [`CHUNK_SIZE`] pixels except possibly the last.
    pub fn to_chunks(&self) -> Vec<Chunk> {
        self.pixels
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(i, slice)| Chunk {
                index: i as u32,
                pixels: slice.to_vec(),
            })
            .collect()
    }

    // ── Files ───────────────────────────────────────────────────────────────

    /// Read a `.png` through the PNG decoder, anything else as PGM.
    pub fn read_image(path: &Path) -> Result<Self, RasterError> {
        if !is_png(path) {
            return Self::read_pgm(path);
        }
        let gray = image::open(path)
            .map_err(|source| RasterError::Png {
                path: path.display().to_string(),
                source,
            })?
            .to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(width, height, gray.into_raw())
    }

    /// Write a `.png` through the PNG encoder, anything else as PGM.
    pub fn write_image(&self, path: &Path) -> Result<(), RasterError> {
        if !is_png(path) {
            return self.write_pgm(path);
        }
        let gray = image::GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| RasterError::DimensionMismatch {
                width: self.width,
                height: self.height,
                expected: u64::from(self.width) * u64::from(self.height),
                actual: self.pixels.len(),
            })?;
        replace_atomically(path, "png.partial", |tmp| {
            gray.save_with_format(tmp, image::ImageFormat::Png)
                .map_err(|source| RasterError::Png {
                    path: path.display().to_string(),
                    source,
                })
        })
    }

    pub fn read_pgm(path: &Path) -> Result<Self, RasterError> {
        let data = std::fs::read(path).map_err(|source| RasterError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_pgm(&data)
    }

    pub fn write_pgm(&self, path: &Path) -> Result<(), RasterError> {
        replace_atomically(path, "pgm.partial", |tmp| {
            std::fs::write(tmp, self.to_pgm()).map_err(|source| RasterError::Write {
                path: path.display().to_string(),
                source,
            })
        })
    }

    pub fn to_pgm(&self) -> Vec<u8> {
        let header = format!("P5\n{} {}\n255\n", self.width, self.height);
        let mut out = Vec::with_capacity(header.len() + self.pixels.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.pixels);
        out
    }

    pub fn parse_pgm(data: &[u8]) -> Result<Self, RasterError> {
        let mut cursor = PgmCursor { data, pos: 0 };

        if cursor.token()? != b"P5" {
            return Err(RasterError::BadFormat("missing P5 magic".into()));
        }
        let width = cursor.number("width")?;
        let height = cursor.number("height")?;
        let maxval = cursor.number("maxval")?;
        if maxval == 0 || maxval > 255 {
            return Err(RasterError::UnsupportedDepth(maxval));
        }

        // Exactly one whitespace byte separates the header from the raster.
        if !cursor.data.get(cursor.pos).is_some_and(u8::is_ascii_whitespace) {
            return Err(RasterError::BadFormat("no separator before raster".into()));
        }
        let start = cursor.pos + 1;
        let expected = u64::from(width) * u64::from(height);
        let available = (data.len() - start.min(data.len())) as u64;
        if available < expected {
            return Err(RasterError::BadFormat(format!(
                "raster truncated: {available} of {expected} bytes"
            )));
        }
        let pixels = data[start..start + expected as usize].to_vec();
        Self::new(width, height, pixels)
    }
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
}

/// Write to a temporary sibling, then rename it over `path`, so a failure
/// never leaves a partial image behind.
fn replace_atomically(
    path: &Path,
    tmp_extension: &str,
    write: impl FnOnce(&Path) -> Result<(), RasterError>,
) -> Result<(), RasterError> {
    let tmp = path.with_extension(tmp_extension);
    if let Err(e) = write(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp);
        RasterError::Write {
            path: path.display().to_string(),
            source,
        }
    })
}

struct PgmCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PgmCursor<'a> {
    /// Next whitespace-delimited header token, skipping `#` comments.
    fn token(&mut self) -> Result<&'a [u8], RasterError> {
        loop {
            match self.data.get(self.pos) {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'#') => {
                    while self.data.get(self.pos).is_some_and(|&b| b != b'\n') {
                        self.pos += 1;
                    }
                }
                Some(_) => break,
                None => return Err(RasterError::BadFormat("header ends early".into())),
            }
        }
        let start = self.pos;
        while self
            .data
            .get(self.pos)
            .is_some_and(|b| !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        Ok(&self.data[start..self.pos])
    }

    fn number(&mut self, field: &str) -> Result<u32, RasterError> {
        let token = self.token()?;
        std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RasterError::BadFormat(format!("invalid {field}")))
    }
}
