// ABOUTME: Stable task fingerprints used as tool record keys
// ABOUTME: SHA-256 over the language and the whitespace-normalized query text

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, Result};

/// Hex-encoded SHA-256 identifying a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a task description for a language.
    ///
    /// Runs of whitespace collapse to a single space and the ends are
    /// trimmed, so reformatting a query does not create a new record.
    /// Case is preserved.
    pub fn for_task(language: &str, query: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(language.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_query(query).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept an externally supplied fingerprint (e.g. from a similarity index)
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(value.to_ascii_lowercase()))
        } else {
            Err(MemoryError::InvalidFingerprint(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse whitespace runs and trim
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
