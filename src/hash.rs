//! Content hasher (C1).
//!
//! BLAKE3 extended to a 64-byte digest ("BLAKE3-512" in the data model). The
//! all-zero digest is a reserved sentinel meaning "no content identity" and
//! is never produced by hashing actual bytes — including the empty input,
//! whose hash is a well-defined non-zero 64-byte value distinct from the
//! sentinel.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 64-byte content digest.
///
/// Wrapped in a newtype (rather than a bare `[u8; 64]`) because `serde`'s
/// built-in array support tops out at 32 elements; this type serialises as a
/// plain 64-byte sequence instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 64]);

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex(&self.0))
    }
}

impl Default for ContentHash {
    fn default() -> Self {
        ZERO64
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct ContentHashVisitor;

impl<'de> Visitor<'de> for ContentHashVisitor {
    type Value = ContentHash;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("64 bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        if v.len() != 64 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(v);
        Ok(ContentHash(out))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(ContentHashVisitor)
    }
}

/// The reserved "empty/non-regular" sentinel. Distinct from `hash(&[])`.
pub const ZERO64: ContentHash = ContentHash([0u8; 64]);

/// Hash full file content into a 64-byte digest.
///
/// The hasher intentionally takes no `flags` argument: content identity is a
/// pure function of bytes (spec §9 open question resolved in SPEC_FULL.md).
pub fn hash_content(data: &[u8]) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut out = [0u8; 64];
    hasher.finalize_xof().fill(&mut out);
    ContentHash(out)
}

/// `true` iff `h` is the reserved sentinel (never a real file's digest).
pub fn is_empty_or_sentinel(h: &ContentHash) -> bool {
    *h == ZERO64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_not_sentinel() {
        let h = hash_content(&[]);
        assert_ne!(h, ZERO64);
        assert!(!is_empty_or_sentinel(&h));
    }

    #[test]
    fn sentinel_is_recognised() {
        assert!(is_empty_or_sentinel(&ZERO64));
    }

    #[test]
    fn deterministic_and_content_sensitive() {
        let a = hash_content(b"hello");
        let b = hash_content(b"hello");
        let c = hash_content(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn full_width_digest() {
        let h = hash_content(b"optivfs");
        assert_eq!(h.0.len(), 64);
    }
}
