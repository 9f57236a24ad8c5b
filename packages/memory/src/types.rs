// ABOUTME: Records and outcomes persisted by the tool store
// ABOUTME: Tool records carry monotonic success/failure counters; error traces group failures by signature

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::ranking::RankingPolicy;

/// What was run for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub query: String,
    pub language: String,
    pub code: String,
}

impl ToolInvocation {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::for_task(&self.language, &self.query)
    }
}

/// Result class of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure { signature: String },
}

/// One execution outcome to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub invocation: ToolInvocation,
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn success(invocation: ToolInvocation) -> Self {
        Self {
            invocation,
            status: OutcomeStatus::Success,
        }
    }

    pub fn failure(invocation: ToolInvocation, signature: impl Into<String>) -> Self {
        Self {
            invocation,
            status: OutcomeStatus::Failure {
                signature: signature.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub fingerprint: Fingerprint,
    /// Last successful invocation, or the first one seen if none succeeded
    pub invocation: ToolInvocation,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Most recent success, if any
    pub last_success: Option<DateTime<Utc>>,
}

impl ToolRecord {
    pub fn success_ratio(&self) -> f64 {
        RankingPolicy::success_ratio(self.success_count, self.failure_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTraceRecord {
    pub fingerprint: Fingerprint,
    pub signature: String,
    pub occurrence_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A tool that hit a failure signature and succeeded afterwards
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownFix {
    /// Carries the successful invocation
    pub record: ToolRecord,
    pub trace: ErrorTraceRecord,
}

/// A lookup hit after success-biased re-ranking
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCandidate {
    pub record: ToolRecord,
    pub similarity: f64,
    pub bias: f64,
    pub score: f64,
    pub worst_trace_count: i64,
}
