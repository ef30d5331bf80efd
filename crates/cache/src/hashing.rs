//! Key hashing
//!
//! Cache keys are opaque strings. Everywhere below the public API an entry is
//! identified by the 64-bit xxh3 digest of its key; the on-disk headers
//! additionally record a 32-bit CRC of the key bytes so a file can be checked
//! against the key it claims to store.

use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// 64-bit digest of a cache key; the primary entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHash(pub u64);

impl EntryHash {
    /// Parse the 16-lowercase-hex-char form used in filenames
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash a cache key to its entry identifier
pub fn entry_hash(key: &str) -> EntryHash {
    EntryHash(xxh3_64(key.as_bytes()))
}

/// 32-bit hash of the key bytes stored in file headers
pub fn key_hash32(key: &str) -> u32 {
    crc32c::crc32c(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_key_sensitive() {
        let a = entry_hash("http://example.com/a");
        let b = entry_hash("http://example.com/b");
        assert_eq!(a, entry_hash("http://example.com/a"));
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let h = entry_hash("some key");
        let s = h.to_string();
        assert_eq!(s.len(), 16);
        assert_eq!(EntryHash::from_hex(&s), Some(h));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert_eq!(EntryHash::from_hex("xyz"), None);
        assert_eq!(EntryHash::from_hex("00000000DEADBEEF"), None); // uppercase
        assert_eq!(EntryHash::from_hex("0123456789abcde"), None); // short
    }
}
