//! Input-signature hashing.
//!
//! A single 160-bit digest over a node's input attributes is recorded and
//! compared to decide whether the node is out of date.  The digest is the
//! truncated finalization of a SHA-256 stream; 20 bytes is plenty to make
//! accidental collisions a non-concern while keeping state records small.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::canon;

pub const DIGEST_SIZE: usize = 20;

/// Separates fields fed to the hash so that adjacent values can't alias
/// (e.g. inputs ["ab", "c"] vs ["a", "bc"]).
const UNIT_SEPARATOR: u8 = 0x1F;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashDigest(pub [u8; DIGEST_SIZE]);

impl HashDigest {
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(DIGEST_SIZE * 2);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Option<HashDigest> {
        if hex.len() != DIGEST_SIZE * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(HashDigest(out))
    }

    pub fn is_zero(self) -> bool {
        self.0 == [0u8; DIGEST_SIZE]
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({})", self.to_hex())
    }
}

impl Serialize for HashDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HashDigest::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("bad digest {:?}", s)))
    }
}

/// Streaming hasher feeding an input signature.
pub struct HashState(Sha256);

impl HashState {
    pub fn new() -> HashState {
        HashState(Sha256::new())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn add_string(&mut self, s: &str) {
        self.0.update(s.as_bytes());
    }

    /// Adds a path with canonical separators, so that the signature is stable
    /// across separator spellings.
    pub fn add_path(&mut self, path: &str) {
        if path.contains('\\') || path.contains("//") {
            self.0.update(canon::canon_separators(path).as_bytes());
        } else {
            self.0.update(path.as_bytes());
        }
    }

    pub fn add_separator(&mut self) {
        self.0.update([UNIT_SEPARATOR]);
    }

    pub fn add_integer(&mut self, value: u64) {
        self.0.update(value.to_le_bytes());
    }

    pub fn finalize(self) -> HashDigest {
        let full = self.0.finalize();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&full[..DIGEST_SIZE]);
        HashDigest(out)
    }
}

impl Default for HashState {
    fn default() -> Self {
        HashState::new()
    }
}

/// Content digest of a file's bytes.
pub fn digest_bytes(bytes: &[u8]) -> HashDigest {
    let mut h = HashState::new();
    h.add_bytes(bytes);
    h.finalize()
}

/// DJB2 over a string; the frontend uses the same function, so hashes in the
/// frozen DAG and hashes computed here agree.
pub fn djb2_hash(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for &b in s.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// DJB2 over a separator-canonicalized path.
pub fn djb2_hash_path(path: &str) -> u32 {
    if path.contains('\\') || path.contains("//") {
        djb2_hash(&canon::canon_separators(path))
    } else {
        djb2_hash(path)
    }
}
