//! Noise model: the fault injection applied by the relay.
//!
//! Only chunk messages are touched. Each chunk is dropped outright with
//! probability `drop_probability`; a surviving chunk has every pixel byte
//! independently zeroed with probability `noise_probability`. Index and
//! length are never altered. Control messages pass through unchanged.
//!
//! Randomness is injected so tests and seeded runs are reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rasterlink_core::Message;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    drop_probability: f64,
    noise_probability: f64,
}

/// What the model did to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseOutcome {
    /// Forward this message (possibly corrupted).
    Forward { message: Message, zeroed: usize },
    /// Chunk discarded.
    Dropped,
}

impl NoiseModel {
    /// Probabilities are clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(drop_probability: f64, noise_probability: f64) -> Self {
        Self {
            drop_probability: clamp_probability(drop_probability),
            noise_probability: clamp_probability(noise_probability),
        }
    }

    /// A transparent model: nothing dropped, nothing corrupted.
    pub fn lossless() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn drop_probability(&self) -> f64 {
        self.drop_probability
    }

    pub fn noise_probability(&self) -> f64 {
        self.noise_probability
    }

    pub fn apply<G: Rng>(&self, message: Message, rng: &mut G) -> NoiseOutcome {
        match message {
            Message::Chunk(mut chunk) => {
                if rng.gen_bool(self.drop_probability) {
                    return NoiseOutcome::Dropped;
                }
                let zeroed = self.corrupt(&mut chunk.pixels, rng);
                NoiseOutcome::Forward {
                    message: Message::Chunk(chunk),
                    zeroed,
                }
            }
            other => NoiseOutcome::Forward {
                message: other,
                zeroed: 0,
            },
        }
    }

    /// Zero each byte with probability `noise_probability`.
    /// Returns how many bytes were zeroed.
    pub fn corrupt<G: Rng>(&self, pixels: &mut [u8], rng: &mut G) -> usize {
        if self.noise_probability == 0.0 {
            return 0;
        }
        let mut zeroed = 0;
        for px in pixels.iter_mut() {
            if rng.gen_bool(self.noise_probability) {
                *px = 0;
                zeroed += 1;
            }
        }
        zeroed
    }
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self::new(0.1, 0.1)
    }
}

pub(crate) fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Build an RNG for one random source.
///
/// With a seed, `stream` separates independent sources (e.g. the two
/// directions of a relay link) so they do not replay the same sequence.
pub fn rng_for(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_entropy(),
    }
}
