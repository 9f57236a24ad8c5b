// ABOUTME: Seam to the external similarity engine that proposes candidate tools
// ABOUTME: Ships an exact-match implementation for deployments without an embedding index

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::fingerprint::{normalize_query, Fingerprint};

/// A candidate proposed by the similarity engine
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub fingerprint: Fingerprint,
    /// Similarity in `[0, 1]`, higher is closer
    pub similarity: f64,
}

/// Similarity engine collaborator.
///
/// The store only ever asks for candidates and tells the engine about new
/// fingerprints; how similarity is computed is up to the implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Up to `limit` candidates for `query`, in any order
    async fn candidates(&self, query: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// Make `fingerprint` discoverable under `text`
    async fn index(&self, fingerprint: &Fingerprint, text: &str) -> Result<()>;
}

/// Returns only tools whose normalized query text matches exactly
#[derive(Debug, Default)]
pub struct ExactMatchSearch {
    entries: RwLock<HashMap<String, Vec<Fingerprint>>>,
}

impl ExactMatchSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SimilaritySearch for ExactMatchSearch {
    async fn candidates(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&normalize_query(query))
            .map(|fingerprints| {
                fingerprints
                    .iter()
                    .take(limit)
                    .map(|fingerprint| Candidate {
                        fingerprint: fingerprint.clone(),
                        similarity: 1.0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn index(&self, fingerprint: &Fingerprint, text: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let slot = entries.entry(normalize_query(text)).or_default();
        if !slot.contains(fingerprint) {
            slot.push(fingerprint.clone());
        }
        Ok(())
    }
}
