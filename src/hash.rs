//! Content hashing
//!
//! SHA-256 digests over raw file bytes, used as the deduplication key.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest of a file's bytes, as 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw content
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a hex digest, normalizing to lowercase
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

/// Only well-formed digests deserialize
impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        ContentHash::from_hex(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid SHA-256 digest: {:?}", value)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
