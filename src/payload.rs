//! Random payload generation for load-generating callers.
//!
//! Payloads are drawn from an alphanumeric symbol set (`0-9`, `@A-Z`,
//! `a-z`) so every payload is valid single-byte UTF-8.

use rand::Rng;

/// Symbols a payload is drawn from.
pub const SYMBOLS: &[u8] = b"0123456789@ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// How long each generated payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSize {
    /// Every payload has exactly this many bytes.
    Fixed(usize),
    /// Length drawn uniformly from `min..=max` per payload.
    Uniform { min: usize, max: usize },
}

impl PayloadSize {
    /// Pick a length for the next payload.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        match *self {
            PayloadSize::Fixed(len) => len,
            PayloadSize::Uniform { min, max } => rng.gen_range(min..=max),
        }
    }

    /// Largest length this policy can produce.
    pub fn max_len(&self) -> usize {
        match *self {
            PayloadSize::Fixed(len) => len,
            PayloadSize::Uniform { max, .. } => max,
        }
    }
}

/// Fill `buf` with `len` random symbols, reusing its allocation.
pub fn fill<R: Rng + ?Sized>(rng: &mut R, buf: &mut Vec<u8>, len: usize) {
    buf.clear();
    buf.extend((0..len).map(|_| SYMBOLS[rng.gen_range(0..SYMBOLS.len())]));
}

/// Generate a fresh payload of `len` symbols.
#[cfg(test)]
pub fn random(len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(len);
    fill(&mut rand::thread_rng(), &mut buf, len);
    buf
}
