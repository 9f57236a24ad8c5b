// ABOUTME: Error types for sandbox execution
// ABOUTME: Classifies failures into infrastructure, configuration, dependency, execution, timeout and admission errors

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::admission::AdmissionError;
use crate::cache::CacheError;
use crate::providers::RuntimeError;
use crate::types::ExecutionResult;

/// Where a timeout happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for an admission slot
    QueueWait,
    /// Running the submitted program
    Execution,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::QueueWait => f.write_str("queue wait"),
            TimeoutPhase::Execution => f.write_str("execution"),
        }
    }
}

/// A package that could not be made available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyFailure {
    pub package: String,
    pub reason: String,
}

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Runtime unavailable or a container operation failed
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Invalid network mode, concurrency setting or request parameter
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// One or more packages failed to resolve or install
    #[error("Dependency error: failed to install {}", format_failures(.failures))]
    Dependency { failures: Vec<DependencyFailure> },

    /// The program exited non-zero
    #[error("Execution failed with exit code {}", .0.exit_code)]
    Execution(Box<ExecutionResult>),

    #[error("Timed out during {phase} after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    /// Admission queue is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Execution cancelled")]
    Cancelled,

    /// Submitted code was rejected by the screen
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`SandboxError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Infrastructure,
    Configuration,
    Dependency,
    Execution,
    Timeout,
    ResourceExhausted,
    Cancelled,
    PolicyViolation,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Infrastructure(_) | SandboxError::Io(_) => ErrorKind::Infrastructure,
            SandboxError::Configuration(_) => ErrorKind::Configuration,
            SandboxError::Dependency { .. } => ErrorKind::Dependency,
            SandboxError::Execution(_) => ErrorKind::Execution,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SandboxError::Cancelled => ErrorKind::Cancelled,
            SandboxError::PolicyViolation(_) => ErrorKind::PolicyViolation,
        }
    }

    /// Whether this failure says something about the submitted code and
    /// belongs in the tool store
    pub fn is_recordable(&self) -> bool {
        matches!(
            self,
            SandboxError::Dependency { .. }
                | SandboxError::Execution(_)
                | SandboxError::Timeout {
                    phase: TimeoutPhase::Execution,
                    ..
                }
        )
    }
}

fn format_failures(failures: &[DependencyFailure]) -> String {
    failures
        .iter()
        .map(|f| f.package.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<RuntimeError> for SandboxError {
    fn from(err: RuntimeError) -> Self {
        SandboxError::Infrastructure(err.to_string())
    }
}

impl From<AdmissionError> for SandboxError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QueueFull { .. } => SandboxError::ResourceExhausted(err.to_string()),
            AdmissionError::QueueTimeout(after) => SandboxError::Timeout {
                phase: TimeoutPhase::QueueWait,
                after,
            },
            AdmissionError::Closed => SandboxError::Infrastructure(err.to_string()),
        }
    }
}

impl From<CacheError> for SandboxError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidSpec(msg) => SandboxError::Configuration(msg),
            other => SandboxError::Infrastructure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
