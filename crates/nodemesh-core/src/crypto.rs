//! Cryptographic utilities for NodeMesh
//!
//! Provides:
//! - Constant-time token comparison for registration and link handshakes
//! - Random token and key generation
//! - BLAKE3 checksums for upload chunk integrity

use blake3::Hasher;

/// Length of a generated node token in bytes (hex-encoded on output)
pub const TOKEN_BYTES: usize = 24;

/// Length of a generated upload key in bytes (hex-encoded on output)
pub const KEY_BYTES: usize = 16;

/// Compare an expected secret with a presented one
///
/// Lengths must match exactly; contents are compared without early exit.
pub fn tokens_match(expected: &[u8], presented: &[u8]) -> bool {
    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Generate a random node token
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
/// Use `try_generate_token` if you need to handle this case.
pub fn generate_token() -> String {
    try_generate_token().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a random node token, returning an error if RNG fails
pub fn try_generate_token() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Generate a random key for chunked uploads
pub fn try_generate_key() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; KEY_BYTES];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Compute BLAKE3 checksum of data
pub fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental checksum over a stream of chunks
pub struct StreamChecksum {
    hasher: Hasher,
    bytes: u64,
}

impl StreamChecksum {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for StreamChecksum {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match(b"abc", b"abc"));
        assert!(!tokens_match(b"abc", b"abd"));
        assert!(!tokens_match(b"abc", b"abcd"));
        assert!(!tokens_match(b"", b""));
    }

    #[test]
    fn test_generate_token() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stream_checksum_matches_oneshot() {
        let data = b"hello mesh, hello relay";
        let mut stream = StreamChecksum::new();
        stream.update(&data[..5]);
        stream.update(&data[5..]);
        assert_eq!(stream.len(), data.len() as u64);
        assert_eq!(stream.finalize(), checksum(data));
    }
}
