// ABOUTME: Core types for sandbox execution requests and results
// ABOUTME: Defines the language catalog, resource limits and the execution result shape

use std::fmt;
use std::str::FromStr;

use neuroforge_config::constants::{
    SANDBOX_IMAGE_C, SANDBOX_IMAGE_CPP, SANDBOX_IMAGE_JAVA, SANDBOX_IMAGE_NODE,
    SANDBOX_IMAGE_PYTHON,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::network::NetworkMode;

/// Supported source languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    C,
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Javascript,
        Language::C,
        Language::Cpp,
        Language::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// File the code is written to inside the workspace
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Javascript => "main.js",
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
            Language::Java => "Main.java",
        }
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.10-slim",
            Language::Javascript => "node:20-bullseye",
            Language::C | Language::Cpp => "gcc:13",
            Language::Java => "openjdk:21-slim",
        }
    }

    /// Environment variable overriding the image
    pub fn image_env(&self) -> &'static str {
        match self {
            Language::Python => SANDBOX_IMAGE_PYTHON,
            Language::Javascript => SANDBOX_IMAGE_NODE,
            Language::C => SANDBOX_IMAGE_C,
            Language::Cpp => SANDBOX_IMAGE_CPP,
            Language::Java => SANDBOX_IMAGE_JAVA,
        }
    }

    /// Shell command run from the workspace directory
    pub fn run_command(&self) -> &'static str {
        match self {
            Language::Python => "python /workspace/main.py",
            Language::Javascript => "node /workspace/main.js",
            Language::C => "gcc main.c -std=c11 -O2 -o main && ./main",
            Language::Cpp => "g++ main.cpp -std=c++17 -O2 -o main && ./main",
            Language::Java => "javac Main.java && java Main",
        }
    }

    /// Only Python snippets get packages installed
    pub fn supports_packages(&self) -> bool {
        matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            other => Err(SandboxError::Configuration(format!(
                "Unsupported language: {}",
                other
            ))),
        }
    }
}

/// Per-container resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpus: f64,
    pub pids: i64,
    /// Size of a tmpfs mounted at /tmp, e.g. "64m"
    pub tmpfs_size: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpus: 1.0,
            pids: 64,
            tmpfs_size: None,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.memory_bytes < 6 * 1024 * 1024 {
            return Err(SandboxError::Configuration(format!(
                "Memory limit {} bytes is below the 6MB minimum",
                self.memory_bytes
            )));
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return Err(SandboxError::Configuration(format!(
                "CPU limit must be positive, got {}",
                self.cpus
            )));
        }
        if self.pids < 1 {
            return Err(SandboxError::Configuration(format!(
                "PID limit must be at least 1, got {}",
                self.pids
            )));
        }
        if let Some(size) = &self.tmpfs_size {
            parse_memory_size(size)?;
        }
        Ok(())
    }

    /// Reject limits that ask for more than the deployment allows
    pub fn check_within(&self, ceiling: &ResourceLimits) -> Result<(), SandboxError> {
        if self.memory_bytes > ceiling.memory_bytes {
            return Err(SandboxError::Configuration(format!(
                "Memory limit {} bytes exceeds the deployment maximum of {}",
                self.memory_bytes, ceiling.memory_bytes
            )));
        }
        if self.cpus > ceiling.cpus {
            return Err(SandboxError::Configuration(format!(
                "CPU limit {} exceeds the deployment maximum of {}",
                self.cpus, ceiling.cpus
            )));
        }
        if self.pids > ceiling.pids {
            return Err(SandboxError::Configuration(format!(
                "PID limit {} exceeds the deployment maximum of {}",
                self.pids, ceiling.pids
            )));
        }
        match (&self.tmpfs_size, &ceiling.tmpfs_size) {
            (Some(_), None) => Err(SandboxError::Configuration(
                "tmpfs is not enabled for this deployment".to_string(),
            )),
            (Some(requested), Some(max)) => {
                let requested_bytes = parse_memory_size(requested)?;
                if requested_bytes > parse_memory_size(max)? {
                    return Err(SandboxError::Configuration(format!(
                        "tmpfs size {} exceeds the deployment maximum of {}",
                        requested, max
                    )));
                }
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Parse a Docker-style size such as `512m`, `1g` or `65536`
pub fn parse_memory_size(value: &str) -> Result<i64, SandboxError> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024_i64),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| SandboxError::Configuration(format!("Invalid size: {:?}", value)))
}

/// A single execution request. Built once, never mutated by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub id: String,
    pub language: Language,
    pub code: String,
    /// Requested network mode; the deployment default applies when absent
    pub network_mode: Option<String>,
    pub timeout_secs: Option<u64>,
    pub limits: Option<ResourceLimits>,
    /// Extra Python requirements such as `pandas==2.2.0`
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Task description used to fingerprint the outcome, defaults to the code
    pub task: Option<String>,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            language,
            code: code.into(),
            network_mode: None,
            timeout_secs: None,
            limits: None,
            requirements: Vec::new(),
            task: None,
        }
    }

    pub fn python(code: impl Into<String>) -> Self {
        Self::new(Language::Python, code)
    }

    pub fn with_network(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Text the outcome is fingerprinted under
    pub fn query(&self) -> &str {
        self.task.as_deref().unwrap_or(&self.code)
    }
}

/// Result of a completed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub request_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub installed_packages: Vec<String>,
    pub failed_packages: Vec<String>,
    pub duration_ms: u64,
    pub container_id: String,
    pub network_mode: NetworkMode,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
