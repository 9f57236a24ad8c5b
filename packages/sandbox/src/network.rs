// ABOUTME: Network policy enforcement for sandbox containers
// ABOUTME: Resolves the effective network mode and rejects anything outside the allow-list before admission

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SandboxError};

/// Network modes a sandbox container may use. Privileged modes such as
/// `host` are not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interface besides loopback
    None,
    /// Default bridge network with outbound access
    Bridge,
}

impl NetworkMode {
    /// Value passed to the container runtime
    pub fn as_runtime_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_runtime_str())
    }
}

impl FromStr for NetworkMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "none" | "isolated" => Ok(NetworkMode::None),
            "bridge" | "bridged" => Ok(NetworkMode::Bridge),
            "host" => Err(SandboxError::Configuration(
                "Network mode 'host' shares the host network stack and is never allowed".to_string(),
            )),
            other if other.starts_with("container:") => Err(SandboxError::Configuration(format!(
                "Network mode '{}' joins another container's namespace and is never allowed",
                other
            ))),
            other => Err(SandboxError::Configuration(format!(
                "Unknown network mode: '{}'",
                other
            ))),
        }
    }
}

/// Resolves requested modes against the deployment's defaults and allow-list
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPolicy {
    default_mode: NetworkMode,
    runner_override: Option<NetworkMode>,
    allowed: Vec<NetworkMode>,
}

impl NetworkPolicy {
    /// Build a policy. The deployment default must itself be allowed.
    pub fn new(
        default_mode: NetworkMode,
        runner_override: Option<NetworkMode>,
        allowed: Vec<NetworkMode>,
    ) -> Result<Self> {
        if allowed.is_empty() {
            return Err(SandboxError::Configuration(
                "Network allow-list is empty".to_string(),
            ));
        }
        let policy = Self {
            default_mode,
            runner_override,
            allowed,
        };
        policy.check_allowed(policy.deployment_default())?;
        Ok(policy)
    }

    /// Mode used when a request does not ask for one
    pub fn deployment_default(&self) -> NetworkMode {
        self.runner_override.unwrap_or(self.default_mode)
    }

    pub fn allowed(&self) -> &[NetworkMode] {
        &self.allowed
    }

    /// Effective mode for a request. A blank request counts as absent.
    pub fn resolve(&self, requested: Option<&str>) -> Result<NetworkMode> {
        let mode = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse::<NetworkMode>()?,
            None => self.deployment_default(),
        };
        self.check_allowed(mode)?;
        debug!("Resolved network mode {:?} -> {}", requested, mode);
        Ok(mode)
    }

    fn check_allowed(&self, mode: NetworkMode) -> Result<()> {
        if self.allowed.contains(&mode) {
            Ok(())
        } else {
            Err(SandboxError::Configuration(format!(
                "Network mode '{}' is not in the allow-list",
                mode
            )))
        }
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            default_mode: NetworkMode::None,
            runner_override: None,
            allowed: vec![NetworkMode::None, NetworkMode::Bridge],
        }
    }
}
