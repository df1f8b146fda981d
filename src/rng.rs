//! Shared pseudo-random stream.
//!
//! A single `StdRng` instance seeded from the OS, guarded by its own lock so
//! every worker thread draws from the same stream instead of paying for a
//! thread-local generator per connection. Used internally for WebSocket
//! client masking keys and surfaced to handlers that need random identifiers
//! (e.g. session tokens) without pulling in a second RNG crate.

use rand::{Rng as _, SeedableRng};
use std::sync::Mutex;

/// Process-wide random stream, accessed under its own lock.
///
/// Cloning a handle is cheap (`Arc`-free: the struct itself is the shared
/// state, stored once behind the [`Server`](crate::Server) and handed out
/// by reference).
pub struct Rng {
    inner: Mutex<rand::rngs::StdRng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng {
    /// Seeds a fresh stream from OS entropy.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(rand::rngs::StdRng::from_entropy()),
        }
    }

    /// Draws the next 64-bit value from the stream.
    ///
    /// # Panics
    /// Panics if the internal lock is poisoned by a prior panicking holder.
    #[inline]
    pub fn next_u64(&self) -> u64 {
        self.inner.lock().expect("rng lock poisoned").gen()
    }

    /// Fills `buf` with random bytes drawn from the stream, one lock
    /// acquisition for the whole buffer.
    ///
    /// Used to generate the 4-byte WebSocket client masking key and the
    /// 16-byte `Sec-WebSocket-Key` nonce.
    #[inline]
    pub fn fill_bytes(&self, buf: &mut [u8]) {
        self.inner.lock().expect("rng lock poisoned").fill(buf);
    }
}
