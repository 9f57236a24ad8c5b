// ABOUTME: Container runtime trait used by the sandbox lifecycle
// ABOUTME: Defines container specs, exec requests and the runtime error type; Docker is the production backend

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::network::NetworkMode;
use crate::types::ResourceLimits;

pub mod docker;

pub use docker::DockerRuntime;

/// Label prefix marking containers owned by this crate
pub const LABEL_PREFIX: &str = "neuroforge.sandbox";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Unique name; all later calls address the container by it
    pub name: String,
    pub image: String,
    pub network_mode: NetworkMode,
    pub limits: ResourceLimits,
    pub mounts: Vec<VolumeMount>,
    pub env: HashMap<String, String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

/// A command to run inside an existing container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            command: vec!["sh".to_string(), "-c".to_string(), script.into()],
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A container carrying our labels, as reported by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub request_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Operations the lifecycle needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime is reachable
    async fn is_available(&self) -> bool;

    /// Create and start a container, returning the runtime's id for it
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Run a command and capture its output.
    ///
    /// Returns [`RuntimeError::TimedOut`] if it has not finished within
    /// `timeout`; the process is left running for the caller to kill.
    async fn exec(&self, name: &str, exec: &ExecSpec, timeout: Duration) -> Result<ExecOutput>;

    /// Kill every process in the container immediately. Killing a stopped or
    /// missing container is not an error.
    async fn force_kill(&self, name: &str) -> Result<()>;

    /// Remove the container and its anonymous volumes. Removing a missing
    /// container is not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Containers carrying the managed label, running or not
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;
}
