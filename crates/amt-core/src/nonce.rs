//! Relay nonce generation.
//!
//! The nonce only correlates responses with requests; it is not a security
//! token, so a time-seeded PRNG is sufficient.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of 32-bit nonces for Relay Discovery and Request messages.
pub trait NonceGenerator: Send {
    /// Produce the next nonce
    fn next_nonce(&mut self) -> u32;
}

/// Generator seeded from the wall clock.
///
/// A fresh PRNG is seeded on every call with the current time in
/// nanoseconds, so consecutive handshakes get unrelated nonces.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeSeededNonce;

impl TimeSeededNonce {
    /// Create a generator
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NonceGenerator for TimeSeededNonce {
    fn next_nonce(&mut self) -> u32 {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        StdRng::seed_from_u64(seed).next_u32()
    }
}

/// Generator returning a fixed sequence, then repeating its last value.
///
/// Used to make handshakes deterministic in tests.
#[derive(Debug, Clone)]
pub struct FixedNonce {
    values: Vec<u32>,
    next: usize,
}

impl FixedNonce {
    /// Always return `nonce`
    #[must_use]
    pub fn new(nonce: u32) -> Self {
        Self::sequence(vec![nonce])
    }

    /// Return `values` in order; an empty list yields zero
    #[must_use]
    pub fn sequence(values: Vec<u32>) -> Self {
        Self { values, next: 0 }
    }
}

impl NonceGenerator for FixedNonce {
    fn next_nonce(&mut self) -> u32 {
        let idx = self.next.min(self.values.len().saturating_sub(1));
        self.next += 1;
        self.values.get(idx).copied().unwrap_or_default()
    }
}
