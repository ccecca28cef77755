//! PIMAP Utils - Hashing and Checksum Utilities
//!
//! Hashing helpers used for shard placement and metric input fingerprints,
//! plus CRC32 checksums for the record log.
//!
//! Key Features:
//! - Fast hashing using xxHash3 for shard selection
//! - Streaming 128-bit fingerprints over typed fields
//! - CRC32 checksums for data integrity verification
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

// =============================================================================
// Hashing Functions
// =============================================================================

/// Compute a 64-bit hash of the given bytes using xxHash3.
#[inline]
pub fn hash64(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Pick a shard for a key.
#[inline]
pub fn shard_for(key: &str, shards: usize) -> usize {
    (hash64(key.as_bytes()) % shards.max(1) as u64) as usize
}

// =============================================================================
// Fingerprinting
// =============================================================================

/// Incremental 128-bit fingerprint over a sequence of typed fields.
///
/// Strings are length-prefixed and floats are hashed by bit pattern, so two
/// different field sequences cannot collide by concatenation.
pub struct Fingerprinter {
    hasher: Xxh3,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.hasher.update(&value.to_bits().to_le_bytes());
        self
    }

    pub fn finish(&self) -> u128 {
        self.hasher.digest128()
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Checksum Functions
// =============================================================================

/// Compute CRC32 checksum for data integrity verification.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify data against expected CRC32 checksum.
#[inline]
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let mut a = Fingerprinter::new();
        a.write_str("wrist_accel").write_i64(1_000).write_f64(1.5);
        let mut b = Fingerprinter::new();
        b.write_str("wrist_accel").write_i64(1_000).write_f64(1.5);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_fingerprint_length_prefix() {
        let mut a = Fingerprinter::new();
        a.write_str("ab").write_str("c");
        let mut b = Fingerprinter::new();
        b.write_str("a").write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_shard_for_in_range() {
        for key in ["a", "bandage", "wrist_accel", ""] {
            assert!(shard_for(key, 16) < 16);
        }
        assert_eq!(shard_for("a", 0), 0);
    }

    #[test]
    fn test_crc32() {
        let data = b"sample:1.0;";
        let checksum = crc32(data);
        assert!(verify_crc32(data, checksum));
        assert!(!verify_crc32(b"sample:2.0;", checksum));
    }
}
