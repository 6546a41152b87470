//! Document identifier generation

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// Number of random bytes behind every identifier (128 bits)
pub const ID_BYTES: usize = 16;

trait SecureRng: RngCore + CryptoRng + Send {}

impl<R: RngCore + CryptoRng + Send> SecureRng for R {}

/// Produces compact, URL-safe document identifiers.
///
/// The random source is injected so tests can seed it; clones share the same
/// source.
#[derive(Clone)]
pub struct IdGenerator {
    rng: Arc<Mutex<Box<dyn SecureRng>>>,
}

impl IdGenerator {
    /// Create a generator drawing from the given cryptographically strong source
    pub fn new<R>(rng: R) -> Self
    where
        R: RngCore + CryptoRng + Send + 'static,
    {
        let rng: Box<dyn SecureRng> = Box::new(rng);
        Self {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Generate a new identifier: 22 characters from `[A-Za-z0-9_-]`
    pub fn generate(&self) -> String {
        let mut bytes = [0u8; ID_BYTES];
        self.rng.lock().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(OsRng)
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
