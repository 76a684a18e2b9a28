//! Content hashing with SHA-256.
//!
//! The digest covers the byte content only; names and media types never
//! feed into it.

use sha2::{Digest as _, Sha256};
use std::fmt;

/// Digest size in bytes (SHA-256 produces 256-bit hashes).
pub const DIGEST_SIZE: usize = 32;

/// A 32-byte SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    /// Parse a digest from 64 hex characters. Uppercase input is accepted.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        if hex_str.len() != DIGEST_SIZE * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(hex_str, &mut out).ok()?;
        Some(Digest(out))
    }

    /// Lowercase hex form, as stored in the catalog.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Incremental hasher fed chunk by chunk during a single forward pass.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
    consumed: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.consumed += chunk.len() as u64;
    }

    /// Bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

/// Hash a complete in-memory buffer.
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}
