// ABOUTME: Per-request container lifecycle state machine
// ABOUTME: Drives Pending -> Creating -> Installing -> Executing -> Completed/Failed -> TornDown with cancellation and guaranteed teardown

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionSlot;
use crate::cache::{CacheError, CachedArtifact, PackageCache};
use crate::error::{DependencyFailure, Result, SandboxError, TimeoutPhase};
use crate::installer::ContainerInstaller;
use crate::network::NetworkMode;
use crate::providers::{
    ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, RuntimeError, VolumeMount, LABEL_PREFIX,
};
use crate::resolver::InstallPlan;
use crate::settings::{DependencyFailurePolicy, SandboxSettings};
use crate::types::{ExecutionRequest, ExecutionResult, ResourceLimits};

/// Where the request's workspace is mounted
pub const WORKSPACE_MOUNT: &str = "/workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Creating,
    Installing,
    Executing,
    Completed,
    Failed,
    TornDown,
}

impl LifecycleState {
    /// Forward-only transitions; TornDown is reachable from anywhere but itself
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Pending, Creating)
            | (Creating, Installing)
            | (Installing, Executing)
            | (Executing, Completed) => true,
            (Creating | Installing | Executing, Failed) => true,
            _ => false,
        }
    }

    /// States in which a container holds runtime resources
    pub fn is_running(self) -> bool {
        matches!(
            self,
            LifecycleState::Creating | LifecycleState::Installing | LifecycleState::Executing
        )
    }
}

/// Broadcast on every state change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub request_id: String,
    pub container_name: String,
    pub state: LifecycleState,
    pub at: DateTime<Utc>,
}

/// Shared collaborators handed to every lifecycle
#[derive(Clone)]
pub struct LifecycleContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub cache: Arc<PackageCache>,
    pub settings: Arc<SandboxSettings>,
    pub events: Option<broadcast::Sender<LifecycleEvent>>,
}

/// Validated inputs for one lifecycle
#[derive(Debug, Clone)]
pub struct LifecyclePlan {
    pub network_mode: NetworkMode,
    pub timeout: Duration,
    pub install_plan: InstallPlan,
}

struct InstalledPackage {
    artifact: CachedArtifact,
    container_path: String,
}

#[derive(Default)]
struct InstallReport {
    installed: Vec<InstalledPackage>,
    failed: Vec<DependencyFailure>,
}

/// Owns exactly one container from creation to removal
pub struct ContainerLifecycle {
    ctx: LifecycleContext,
    request: ExecutionRequest,
    plan: LifecyclePlan,
    limits: ResourceLimits,
    image: String,
    name: String,
    container_id: Option<String>,
    create_attempted: bool,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    workspace: Option<TempDir>,
    slot: Option<AdmissionSlot>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i64>,
}

impl ContainerLifecycle {
    pub fn new(
        ctx: LifecycleContext,
        request: ExecutionRequest,
        plan: LifecyclePlan,
        slot: AdmissionSlot,
    ) -> Self {
        let limits = request
            .limits
            .clone()
            .unwrap_or_else(|| ctx.settings.limits.clone());
        let image = ctx.settings.image_for(request.language).to_string();
        let name = format!("nf-{}", Uuid::new_v4().simple());

        let lifecycle = Self {
            ctx,
            request,
            plan,
            limits,
            image,
            name,
            container_id: None,
            create_attempted: false,
            state: LifecycleState::Pending,
            history: vec![LifecycleState::Pending],
            workspace: None,
            slot: Some(slot),
            started_at: None,
            finished_at: None,
            exit_code: None,
        };
        lifecycle.emit(LifecycleState::Pending);
        lifecycle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered, in order
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.plan.network_mode
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Drive the container to a terminal state and tear it down.
    ///
    /// Teardown runs on every path, including errors and cancellation.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let outcome = self.drive(cancel).await;
        match &outcome {
            Ok(result) => info!(
                "Request {} completed in {}ms",
                self.request.id, result.duration_ms
            ),
            Err(SandboxError::Cancelled) => info!("Request {} cancelled", self.request.id),
            Err(e) => warn!("Request {} failed: {}", self.request.id, e),
        }
        self.teardown().await;
        outcome
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let started = Instant::now();
        self.started_at = Some(Utc::now());

        self.transition(LifecycleState::Creating)?;
        let workspace = self.prepare_workspace().await;
        self.workspace = Some(self.settle(workspace)?);
        self.create_attempted = true;
        let created = self.guarded(cancel, self.create_container()).await;
        self.container_id = Some(self.settle(created)?);

        self.transition(LifecycleState::Installing)?;
        let installed = self.guarded(cancel, self.install_packages()).await;
        let report = self.settle(installed)?;

        self.transition(LifecycleState::Executing)?;
        let executed = self.guarded(cancel, self.execute_code(&report.installed)).await;
        let output = self.settle(executed)?;
        self.exit_code = Some(output.exit_code);

        let result = ExecutionResult {
            request_id: self.request.id.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            installed_packages: report
                .installed
                .iter()
                .map(|p| p.artifact.package.clone())
                .collect(),
            failed_packages: report.failed.iter().map(|f| f.package.clone()).collect(),
            duration_ms: started.elapsed().as_millis() as u64,
            container_id: self
                .container_id
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            network_mode: self.plan.network_mode,
        };

        if result.succeeded() {
            self.transition(LifecycleState::Completed)?;
            Ok(result)
        } else {
            self.transition(LifecycleState::Failed)?;
            Err(SandboxError::Execution(Box::new(result)))
        }
    }

    /// Run a phase, aborting it if `cancel` fires.
    ///
    /// On cancellation the container is killed while the phase future is
    /// still alive; the phase (and any cache lock it holds) is dropped after.
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        phase: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut phase = std::pin::pin!(phase);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelling request {} during {:?}", self.request.id, self.state);
                self.kill_quietly().await;
                Err(SandboxError::Cancelled)
            }
            result = &mut phase => result,
        }
    }

    /// Mark the lifecycle Failed on a non-cancellation error
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !matches!(e, SandboxError::Cancelled)
                && self.state.can_transition_to(LifecycleState::Failed)
            {
                self.record_state(LifecycleState::Failed);
            }
        }
        result
    }

    async fn prepare_workspace(&self) -> Result<TempDir> {
        let dir = tokio::task::spawn_blocking(|| tempfile::Builder::new().prefix("nf-ws-").tempdir())
            .await
            .map_err(|e| {
                SandboxError::Infrastructure(format!("workspace setup task failed: {}", e))
            })??;
        tokio::fs::write(
            dir.path().join(self.request.language.source_file()),
            &self.request.code,
        )
        .await?;
        debug!(
            "Prepared workspace {} for request {}",
            dir.path().display(),
            self.request.id
        );
        Ok(dir)
    }

    async fn create_container(&self) -> Result<String> {
        let workspace = self.workspace.as_ref().ok_or_else(|| {
            SandboxError::Infrastructure("workspace was not prepared".to_string())
        })?;

        let spec = ContainerSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            network_mode: self.plan.network_mode,
            limits: self.limits.clone(),
            mounts: vec![
                VolumeMount {
                    host_path: workspace.path().to_path_buf(),
                    container_path: WORKSPACE_MOUNT.to_string(),
                    readonly: false,
                },
                VolumeMount {
                    host_path: self.ctx.cache.root().to_path_buf(),
                    container_path: self.ctx.settings.cache_mount.clone(),
                    readonly: false,
                },
            ],
            env: HashMap::from([("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]),
            working_dir: WORKSPACE_MOUNT.to_string(),
            labels: HashMap::from([(
                format!("{}.request", LABEL_PREFIX),
                self.request.id.clone(),
            )]),
        };

        self.ctx.runtime.create(&spec).await.map_err(|e| {
            SandboxError::Infrastructure(format!(
                "failed to create container {}: {}",
                self.name, e
            ))
        })
    }

    async fn install_packages(&self) -> Result<InstallReport> {
        let mut report = InstallReport::default();
        let entries = &self.plan.install_plan.entries;
        if entries.is_empty() {
            return Ok(report);
        }

        info!(
            "Installing {} package(s) for request {}",
            entries.len(),
            self.request.id
        );
        let settings = &self.ctx.settings;
        let installer = ContainerInstaller::new(
            self.ctx.runtime.as_ref(),
            &self.name,
            self.ctx.cache.root(),
            &settings.cache_mount,
            settings.install_timeout,
        );

        for spec in entries {
            match self.ctx.cache.fetch_or_install(spec, &installer).await {
                Ok(artifact) => {
                    let container_path = installer.container_path(&artifact.host_path)?;
                    report.installed.push(InstalledPackage {
                        artifact,
                        container_path,
                    });
                }
                Err(e @ (CacheError::Io(_) | CacheError::Manifest(_))) => {
                    return Err(SandboxError::Infrastructure(format!(
                        "package cache failure while installing {}: {}",
                        spec, e
                    )));
                }
                Err(e) => {
                    warn!("Request {}: {}", self.request.id, e);
                    report.failed.push(DependencyFailure {
                        package: spec.package.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !report.failed.is_empty() {
            match settings.dependency_failure_policy {
                DependencyFailurePolicy::Abort => {
                    return Err(SandboxError::Dependency {
                        failures: report.failed,
                    });
                }
                DependencyFailurePolicy::Proceed => warn!(
                    "Request {} proceeding without {} package(s)",
                    self.request.id,
                    report.failed.len()
                ),
            }
        }
        Ok(report)
    }

    async fn execute_code(&self, installed: &[InstalledPackage]) -> Result<ExecOutput> {
        let mut exec = ExecSpec::shell(self.request.language.run_command())
            .with_working_dir(WORKSPACE_MOUNT);
        if !installed.is_empty() {
            let python_path = installed
                .iter()
                .map(|p| p.container_path.as_str())
                .collect::<Vec<_>>()
                .join(":");
            exec = exec.with_env("PYTHONPATH", python_path);
        }

        match self.ctx.runtime.exec(&self.name, &exec, self.plan.timeout).await {
            Ok(output) => {
                debug!(
                    "Request {} exited with {}",
                    self.request.id, output.exit_code
                );
                Ok(output)
            }
            Err(RuntimeError::TimedOut(_)) => {
                warn!(
                    "Request {} exceeded {:?}, killing {}",
                    self.request.id, self.plan.timeout, self.name
                );
                self.kill_quietly().await;
                Err(SandboxError::Timeout {
                    phase: TimeoutPhase::Execution,
                    after: self.plan.timeout,
                })
            }
            Err(e) => Err(SandboxError::Infrastructure(format!(
                "failed to run code in {}: {}",
                self.name, e
            ))),
        }
    }

    async fn kill_quietly(&self) {
        if !self.create_attempted {
            return;
        }
        if let Err(e) = self.ctx.runtime.force_kill(&self.name).await {
            warn!("Failed to kill container {}: {}", self.name, e);
        }
    }

    /// Remove the container and workspace and release the admission slot.
    /// Calling it again is a no-op.
    pub async fn teardown(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }

        if self.create_attempted {
            if let Err(e) = self.ctx.runtime.remove(&self.name).await {
                warn!("Failed to remove container {}: {}", self.name, e);
            }
        }

        if let Some(workspace) = self.workspace.take() {
            remove_workspace(workspace).await;
        }

        if let Some(slot) = self.slot.take() {
            slot.release();
        }

        self.finished_at = Some(Utc::now());
        self.record_state(LifecycleState::TornDown);
        debug!("Container {} torn down", self.name);
    }

    fn transition(&mut self, next: LifecycleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::Infrastructure(format!(
                "invalid lifecycle transition {:?} -> {:?} for {}",
                self.state, next, self.name
            )));
        }
        self.record_state(next);
        Ok(())
    }

    fn record_state(&mut self, next: LifecycleState) {
        debug!("Container {}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        self.history.push(next);
        self.emit(next);
    }

    fn emit(&self, state: LifecycleState) {
        if let Some(tx) = &self.ctx.events {
            send_event(tx, &self.request.id, &self.name, state);
        }
    }
}

async fn remove_workspace(workspace: TempDir) {
    let path = workspace.path().to_path_buf();
    match tokio::task::spawn_blocking(move || workspace.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to remove workspace {}: {}", path.display(), e),
        Err(e) => warn!("Workspace removal task for {} failed: {}", path.display(), e),
    }
}

fn send_event(
    tx: &broadcast::Sender<LifecycleEvent>,
    request_id: &str,
    container_name: &str,
    state: LifecycleState,
) {
    if tx.receiver_count() == 0 {
        return;
    }
    let event = LifecycleEvent {
        request_id: request_id.to_string(),
        container_name: container_name.to_string(),
        state,
        at: Utc::now(),
    };
    if let Err(e) = tx.send(event) {
        debug!("Dropped lifecycle event: {}", e);
    }
}

impl Drop for ContainerLifecycle {
    fn drop(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        if !self.create_attempted {
            if let Some(tx) = &self.ctx.events {
                send_event(tx, &self.request.id, &self.name, LifecycleState::TornDown);
            }
            return;
        }

        warn!(
            "Lifecycle for {} dropped before teardown, removing container in background",
            self.name
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.ctx.runtime.clone();
                let events = self.ctx.events.clone();
                let name = self.name.clone();
                let request_id = self.request.id.clone();
                // The slot is held until the container is gone
                let slot = self.slot.take();
                let workspace = self.workspace.take();
                handle.spawn(async move {
                    if let Err(e) = runtime.force_kill(&name).await {
                        warn!("Background kill of {} failed: {}", name, e);
                    }
                    if let Err(e) = runtime.remove(&name).await {
                        warn!("Background removal of {} failed: {}", name, e);
                    }
                    if let Some(workspace) = workspace {
                        remove_workspace(workspace).await;
                    }
                    if let Some(slot) = slot {
                        slot.release();
                    }
                    if let Some(tx) = &events {
                        send_event(tx, &request_id, &name, LifecycleState::TornDown);
                    }
                });
            }
            Err(_) => warn!(
                "No async runtime available, container {} may be orphaned",
                self.name
            ),
        }
    }
}
