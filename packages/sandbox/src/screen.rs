// ABOUTME: Optional deny-pattern screen for submitted code
// ABOUTME: Rejects snippets that reach for process, socket or eval primitives before any resource is used

use regex::Regex;
use tracing::warn;

use crate::error::{Result, SandboxError};

/// Patterns rejected when screening is enabled
pub const DENY_PATTERNS: &[&str] = &[
    r"\bexec\b",
    r"\beval\b",
    r"system\(",
    r"fork\(",
    r"socket\.",
    r"subprocess\.",
    r"popen\(",
    r"#include\s*<sys/",
    r"#include\s*<netinet",
    r"import\s+socket",
    r"Runtime\.getRuntime",
];

pub struct CodeScreen {
    patterns: Vec<Regex>,
}

impl CodeScreen {
    pub fn new() -> Result<Self> {
        Self::with_patterns(DENY_PATTERNS)
    }

    pub fn with_patterns(patterns: &[&str]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    SandboxError::Configuration(format!("Invalid deny pattern {:?}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn check(&self, request_id: &str, code: &str) -> Result<()> {
        match self.patterns.iter().find(|p| p.is_match(code)) {
            Some(pattern) => {
                warn!(
                    "Rejecting request {}: code matches deny pattern {}",
                    request_id,
                    pattern.as_str()
                );
                Err(SandboxError::PolicyViolation(format!(
                    "code matches denied pattern {}",
                    pattern.as_str()
                )))
            }
            None => Ok(()),
        }
    }
}
