// ABOUTME: Sandbox orchestrator, the execute entry point wiring admission, lifecycle and tool store
// ABOUTME: Validates requests before any resource is committed and records recordable outcomes

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use neuroforge_memory::{trace_signature, Outcome, ToolInvocation, ToolStore};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionStats};
use crate::cache::PackageCache;
use crate::error::{Result, SandboxError};
use crate::lifecycle::{ContainerLifecycle, LifecycleContext, LifecycleEvent, LifecyclePlan};
use crate::providers::{ContainerRuntime, DockerRuntime};
use crate::resolver::DependencyResolver;
use crate::screen::CodeScreen;
use crate::settings::SandboxSettings;
use crate::types::{ExecutionRequest, ExecutionResult};

/// Outcome of an orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub found: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

pub struct SandboxOrchestrator {
    settings: Arc<SandboxSettings>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<PackageCache>,
    admission: AdmissionController,
    resolver: DependencyResolver,
    screen: Option<CodeScreen>,
    tool_store: Option<Arc<ToolStore>>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl SandboxOrchestrator {
    pub fn new(settings: SandboxSettings, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let admission = AdmissionController::new(
            settings.max_concurrency,
            settings.max_queue,
            settings.queue_timeout,
        )?;
        let cache = Arc::new(PackageCache::new(settings.cache_dir.clone())?);
        let resolver = DependencyResolver::new(settings.base_packages.iter().cloned());
        let screen = if settings.screen_code {
            Some(CodeScreen::new()?)
        } else {
            None
        };
        let (event_tx, _) = broadcast::channel(settings.event_channel_size);

        info!(
            "Sandbox orchestrator ready: concurrency {}, default network {}, cache {}",
            settings.max_concurrency,
            settings.network.deployment_default(),
            settings.cache_dir.display()
        );

        Ok(Self {
            settings: Arc::new(settings),
            runtime,
            cache,
            admission,
            resolver,
            screen,
            tool_store: None,
            event_tx,
        })
    }

    /// Build from environment variables against the local Docker daemon
    pub fn from_env() -> Result<Self> {
        let settings = SandboxSettings::from_env()?;
        let runtime = DockerRuntime::new()?;
        Self::new(settings, Arc::new(runtime))
    }

    /// Record every recordable outcome into `store`
    pub fn with_tool_store(mut self, store: Arc<ToolStore>) -> Self {
        self.tool_store = Some(store);
        self
    }

    /// Subscribe to lifecycle state changes of every request
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    pub fn tool_store(&self) -> Option<&ToolStore> {
        self.tool_store.as_deref()
    }

    /// Refuse all queued and future requests
    pub fn shutdown(&self) {
        info!("Sandbox orchestrator shutting down");
        self.admission.close();
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one request to completion, or until `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let plan = self.prepare(&request).map_err(|e| {
            warn!("Rejected request {}: {}", request.id, e);
            e
        })?;

        debug!("Request {} waiting for an execution slot", request.id);
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Request {} cancelled while queued", request.id);
                return Err(SandboxError::Cancelled);
            }
            acquired = self.admission.acquire() => acquired.map_err(|e| {
                warn!("Request {} not admitted: {}", request.id, e);
                SandboxError::from(e)
            })?,
        };
        info!(
            "Request {} admitted after {:?} ({} {}, network {})",
            request.id,
            slot.waited(),
            request.language,
            if plan.install_plan.is_empty() {
                "without packages".to_string()
            } else {
                format!("with {}", plan.install_plan.packages().join(", "))
            },
            plan.network_mode
        );

        let mut lifecycle =
            ContainerLifecycle::new(self.lifecycle_context(), request.clone(), plan, slot);
        let outcome = lifecycle.run(&cancel).await;

        self.record_outcome(&request, &outcome).await;
        outcome
    }

    /// Validate a request and build its plan without touching the runtime
    fn prepare(&self, request: &ExecutionRequest) -> Result<LifecyclePlan> {
        if request.code.trim().is_empty() {
            return Err(SandboxError::Configuration(
                "Code must not be empty".to_string(),
            ));
        }
        if let Some(limits) = &request.limits {
            limits.validate()?;
            limits.check_within(&self.settings.limits)?;
        }
        let timeout = self.settings.effective_timeout(request.timeout_secs)?;
        let network_mode = self
            .settings
            .network
            .resolve(request.network_mode.as_deref())?;
        if let Some(screen) = &self.screen {
            screen.check(&request.id, &request.code)?;
        }
        let install_plan =
            self.resolver
                .resolve(request.language, &request.code, &request.requirements)?;

        Ok(LifecyclePlan {
            network_mode,
            timeout,
            install_plan,
        })
    }

    fn lifecycle_context(&self) -> LifecycleContext {
        LifecycleContext {
            runtime: self.runtime.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            events: Some(self.event_tx.clone()),
        }
    }

    async fn record_outcome(&self, request: &ExecutionRequest, result: &Result<ExecutionResult>) {
        let Some(store) = &self.tool_store else {
            return;
        };

        let invocation = ToolInvocation {
            query: request.query().to_string(),
            language: request.language.as_str().to_string(),
            code: request.code.clone(),
        };
        let outcome = match result {
            Ok(_) => Outcome::success(invocation),
            Err(e) if e.is_recordable() => Outcome::failure(invocation, failure_signature(e)),
            Err(_) => return,
        };

        let fingerprint = outcome.invocation.fingerprint();
        match store.record(&fingerprint, &outcome).await {
            Ok(record) => debug!(
                "Recorded outcome of request {} under {} ({} ok / {} failed)",
                request.id, fingerprint, record.success_count, record.failure_count
            ),
            Err(e) => warn!(
                "Failed to record outcome of request {}: {}",
                request.id, e
            ),
        }
    }

    /// Kill and remove managed containers older than `max_age`.
    /// Containers without a creation time count as stale.
    pub async fn sweep_orphans(&self, max_age: Duration) -> Result<SweepReport> {
        let containers = self.runtime.list_managed().await.map_err(|e| {
            error!("Failed to list managed containers: {}", e);
            SandboxError::from(e)
        })?;
        let cutoff = chrono::Duration::from_std(max_age)
            .map(|age| Utc::now() - age)
            .map_err(|e| SandboxError::Configuration(format!("Invalid max age: {}", e)))?;

        let mut report = SweepReport::default();
        for container in containers {
            let stale = container
                .created_at
                .map(|created| created < cutoff)
                .unwrap_or(true);
            if !stale {
                continue;
            }

            report.found += 1;
            warn!(
                "Found orphaned container {} (request {})",
                container.name,
                container.request_id.as_deref().unwrap_or("unknown")
            );
            if let Err(e) = self.runtime.force_kill(&container.name).await {
                debug!("Kill of orphan {} failed: {}", container.name, e);
            }
            match self.runtime.remove(&container.name).await {
                Ok(()) => {
                    info!("Removed orphaned container {}", container.name);
                    report.removed += 1;
                }
                Err(e) => {
                    let message = format!(
                        "Failed to remove orphaned container {}: {}",
                        container.name, e
                    );
                    warn!("{}", message);
                    report.errors.push(message);
                }
            }
        }

        info!(
            "Orphan sweep complete: found {}, removed {} (failed: {})",
            report.found,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }
}

/// Trace signature stored for a recordable failure
fn failure_signature(error: &SandboxError) -> String {
    match error {
        SandboxError::Execution(result) => trace_signature(&result.stderr),
        SandboxError::Dependency { failures } => {
            let reasons = failures
                .iter()
                .map(|f| format!("{}: {}", f.package, f.reason))
                .collect::<Vec<_>>()
                .join("\n");
            format!("DependencyError: {}", trace_signature(&reasons))
        }
        other => trace_signature(&other.to_string()),
    }
}
