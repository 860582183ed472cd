//! Streaming digest primitives used by every ID-algebra crate (FileID,
//! LicenceID, ChrootGroupID, EnvID, SourceID, ProjID, ResultID, BuildID).
//!
//! All of drydock's content-addressed IDs are computed by feeding an ordered
//! sequence of fields into a [`Hasher`] and reading back a [`Digest`]. Fields
//! are fed through [`Hasher::hash_line`], which length-prefixes each field so
//! that two different field sequences can never collapse onto the same
//! digest through naive concatenation (`("ab", "c")` vs. `("a", "bc")`).

use std::fmt;

use sha2::{Digest as _, Sha256};

/// A 256-bit content digest, rendered as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Incremental SHA-256 builder for ID computation.
#[derive(Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Feed a length-prefixed, newline-terminated field into the digest.
    ///
    /// This is the unit of composition for every ID algorithm in drydock:
    /// each "step" of a FileID/ResultID/etc computation is one `hash_line`
    /// call, in a fixed order per object.
    pub fn hash_line(&mut self, field: &str) -> &mut Self {
        self.inner.update((field.len() as u64).to_le_bytes());
        self.inner.update(field.as_bytes());
        self.inner.update(b"\n");
        self
    }

    /// Feed raw bytes (e.g. a file's checksum bytes) length-prefixed.
    pub fn hash_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn finish(self) -> Digest {
        let out = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

/// One-shot digest of a single byte string.
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut h = Hasher::new();
    h.hash_bytes(data);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_hex() {
        let d = hash_bytes(b"hello");
        let hex = d.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, d.to_string());
    }

    #[test]
    fn hash_line_is_length_prefixed_not_naive_concat() {
        let mut a = Hasher::new();
        a.hash_line("ab").hash_line("c");
        let mut b = Hasher::new();
        b.hash_line("a").hash_line("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn same_field_sequence_is_deterministic() {
        let mut a = Hasher::new();
        a.hash_line("x").hash_line("y");
        let mut b = Hasher::new();
        b.hash_line("x").hash_line("y");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn empty_hasher_is_stable() {
        assert_eq!(Hasher::new().finish(), Hasher::new().finish());
    }

    proptest::proptest! {
        #[test]
        fn hash_bytes_is_deterministic(data: Vec<u8>) {
            proptest::prop_assert_eq!(hash_bytes(&data), hash_bytes(&data));
        }

        #[test]
        fn distinct_field_lists_rarely_collide(a: Vec<String>, b: Vec<String>) {
            proptest::prop_assume!(a != b);
            let mut ha = Hasher::new();
            for f in &a { ha.hash_line(f); }
            let mut hb = Hasher::new();
            for f in &b { hb.hash_line(f); }
            proptest::prop_assert_ne!(ha.finish(), hb.finish());
        }
    }
}
