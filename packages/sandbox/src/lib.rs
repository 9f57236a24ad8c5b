// ABOUTME: Sandboxed code execution with bounded concurrency and a shared package cache
// ABOUTME: Runs each request in its own hardened container and records outcomes into the tool store

pub mod admission;
pub mod cache;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod network;
pub mod orchestrator;
pub mod providers;
pub mod resolver;
pub mod screen;
pub mod settings;
pub mod types;

pub use admission::{AdmissionController, AdmissionError, AdmissionSlot, AdmissionStats};
pub use cache::{CacheError, CacheKey, CachedArtifact, PackageCache, PackageInstaller};
pub use error::{DependencyFailure, ErrorKind, Result, SandboxError, TimeoutPhase};
pub use installer::ContainerInstaller;
pub use lifecycle::{
    ContainerLifecycle, LifecycleContext, LifecycleEvent, LifecyclePlan, LifecycleState,
    WORKSPACE_MOUNT,
};
pub use network::{NetworkMode, NetworkPolicy};
pub use orchestrator::{SandboxOrchestrator, SweepReport};
pub use providers::{
    ContainerRuntime, ContainerSpec, DockerRuntime, ExecOutput, ExecSpec, ManagedContainer,
    RuntimeError, VolumeMount, LABEL_PREFIX,
};
pub use resolver::{DependencyResolver, DependencySource, DependencySpec, InstallPlan};
pub use screen::CodeScreen;
pub use settings::{DependencyFailurePolicy, SandboxSettings};
pub use types::{ExecutionRequest, ExecutionResult, Language, ResourceLimits};
