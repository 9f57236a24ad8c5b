// ABOUTME: Retrieval-augmented tool memory for NeuroForge
// ABOUTME: Records sandbox outcomes by task fingerprint and ranks past tools with a success bias

pub mod error;
pub mod fingerprint;
pub mod ranking;
pub mod signature;
pub mod similarity;
pub mod store;
pub mod types;

pub use error::{MemoryError, Result};
pub use fingerprint::Fingerprint;
pub use ranking::RankingPolicy;
pub use signature::trace_signature;
pub use similarity::{Candidate, ExactMatchSearch, SimilaritySearch};
pub use store::ToolStore;
pub use types::{
    ErrorTraceRecord, KnownFix, Outcome, OutcomeStatus, RankedCandidate, ToolInvocation, ToolRecord,
};
