//! # Sharding Strategy
//!
//! Purpose: Map a key to the index of the connection that owns it.
//!
//! ## Design Principles
//! 1. **Deterministic**: The same key and connection count always give the
//!    same index, across processes.
//! 2. **Always In Range**: Whatever a strategy returns is reduced into
//!    `0..count`.

use std::fmt;
use std::sync::Arc;

type SelectFn = dyn Fn(&str, usize) -> usize + Send + Sync;

/// Key to connection-index mapping.
#[derive(Clone)]
pub enum Strategy {
    /// Everything on connection 0.
    Solo,
    /// `|crc32(key) as i32| % count`, fed the low byte of every UTF-16
    /// code unit of the key (identical to the UTF-8 bytes for ASCII keys).
    Hash,
    Custom(Arc<SelectFn>),
}

impl Strategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, usize) -> usize + Send + Sync + 'static,
    {
        Strategy::Custom(Arc::new(f))
    }

    /// Default for a cluster of `count` servers.
    pub fn for_count(count: usize) -> Self {
        if count <= 1 {
            Strategy::Solo
        } else {
            Strategy::Hash
        }
    }

    pub fn select(&self, key: &str, count: usize) -> usize {
        if count <= 1 {
            return 0;
        }
        match self {
            Strategy::Solo => 0,
            Strategy::Hash => (key_crc(key) as i32).unsigned_abs() as usize % count,
            Strategy::Custom(f) => f(key, count) % count,
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Solo => f.write_str("Solo"),
            Strategy::Hash => f.write_str("Hash"),
            Strategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE 802.3), as used by zlib.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_of(data.iter().copied())
}

/// CRC over the low byte of each UTF-16 code unit of `key`.
fn key_crc(key: &str) -> u32 {
    crc32_of(key.encode_utf16().map(|unit| unit as u8))
}

fn crc32_of(bytes: impl IntoIterator<Item = u8>) -> u32 {
    let mut crc = !0u32;
    for byte in bytes {
        crc = CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_values() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b"Hello World"), 0x4A17_B156);
    }

    #[test]
    fn solo_is_always_zero() {
        for key in ["a", "b", "Hello World"] {
            assert_eq!(Strategy::Solo.select(key, 8), 0);
        }
    }

    #[test]
    fn hash_matches_reference_shard() {
        assert_eq!(Strategy::Hash.select("Hello World", 16), 6);
    }

    #[test]
    fn hash_uses_low_byte_of_utf16_units() {
        assert_eq!(key_crc("Hello World"), crc32(b"Hello World"));
        // U+00E9 is one unit (0xE9); U+20AC truncates to 0xAC; U+1F600 is a
        // surrogate pair 0xD83D 0xDE00.
        assert_eq!(key_crc("\u{e9}"), crc32(&[0xE9]));
        assert_eq!(key_crc("\u{20ac}uro"), crc32(&[0xAC, b'u', b'r', b'o']));
        assert_eq!(key_crc("\u{1f600}"), crc32(&[0x3D, 0x00]));
        assert_ne!(key_crc("\u{e9}"), crc32("\u{e9}".as_bytes()));

        let expected = (crc32(&[0xAC, b'u', b'r', b'o']) as i32).unsigned_abs() as usize % 7;
        assert_eq!(Strategy::Hash.select("\u{20ac}uro", 7), expected);
    }

    #[test]
    fn hash_is_deterministic_and_in_range() {
        for count in 2..9 {
            for i in 0..200 {
                let key = format!("key:{}", i);
                let first = Strategy::Hash.select(&key, count);
                assert!(first < count);
                assert_eq!(first, Strategy::Hash.select(&key, count));
            }
        }
    }

    #[test]
    fn single_connection_short_circuits() {
        let strategy = Strategy::custom(|_, _| 41);
        assert_eq!(strategy.select("k", 1), 0);
        assert_eq!(strategy.select("k", 0), 0);
        assert_eq!(strategy.select("k", 4), 1);
    }

    #[test]
    fn default_for_count() {
        assert!(matches!(Strategy::for_count(1), Strategy::Solo));
        assert!(matches!(Strategy::for_count(3), Strategy::Hash));
    }
}
