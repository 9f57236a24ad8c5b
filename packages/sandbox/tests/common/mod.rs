// ABOUTME: In-memory container runtime shared by the sandbox integration tests
// ABOUTME: Records every runtime call, tracks live containers and emulates pip installs on the host cache

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use neuroforge_sandbox::{
    ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, ManagedContainer, RuntimeError,
    SandboxOrchestrator, SandboxSettings,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create(String),
    Pip { container: String, requirement: String },
    Run { container: String, python_path: Option<String> },
    Kill(String),
    Remove(String),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    live: HashMap<String, ContainerSpec>,
    max_live: usize,
}

/// Container runtime that never touches Docker.
///
/// Code runs "succeed" after `run_delay` with `exit_code`; pip installs write a
/// package directory into the host path behind the cache mount.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    run_delay: Duration,
    install_delay: Duration,
    kill_delay: Duration,
    exit_code: i64,
    stderr: String,
    failing_packages: HashSet<String>,
    fail_create: bool,
    installs: AtomicUsize,
    orphans: Mutex<Vec<ManagedContainer>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            run_delay: Duration::from_millis(10),
            install_delay: Duration::from_millis(10),
            kill_delay: Duration::ZERO,
            exit_code: 0,
            stderr: String::new(),
            failing_packages: HashSet::new(),
            fail_create: false,
            installs: AtomicUsize::new(0),
            orphans: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = delay;
        self
    }

    pub fn with_kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = delay;
        self
    }

    pub fn with_exit(mut self, code: i64, stderr: &str) -> Self {
        self.exit_code = code;
        self.stderr = stderr.to_string();
        self
    }

    pub fn with_failing_package(mut self, package: &str) -> Self {
        self.failing_packages.insert(package.to_string());
        self
    }

    pub fn with_failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn with_orphans(self, orphans: Vec<ManagedContainer>) -> Self {
        *self.orphans.lock().unwrap() = orphans;
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn pip_requirements(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Pip { requirement, .. } => Some(requirement),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Host directory behind `container_path`, via the container's mounts
    fn host_path(&self, container: &str, container_path: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        let spec = state.live.get(container)?;
        spec.mounts.iter().find_map(|mount| {
            container_path
                .strip_prefix(&mount.container_path)
                .map(|rest| mount.host_path.join(rest.trim_start_matches('/')))
        })
    }

    async fn pip_install(&self, container: &str, command: &[String]) -> ExecOutput {
        let requirement = command.last().cloned().unwrap_or_default();
        self.record(RuntimeCall::Pip {
            container: container.to_string(),
            requirement: requirement.clone(),
        });
        tokio::time::sleep(self.install_delay).await;

        let package = requirement
            .split(|c: char| "=<>~!".contains(c))
            .next()
            .unwrap_or_default()
            .to_string();
        if self.failing_packages.contains(&package) {
            return ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!(
                    "ERROR: Could not find a version that satisfies the requirement {}\nERROR: No matching distribution found for {}\n",
                    requirement, package
                ),
            };
        }

        let target = command
            .iter()
            .position(|arg| arg == "--target")
            .and_then(|i| command.get(i + 1))
            .and_then(|t| self.host_path(container, t));
        let Some(target) = target else {
            return ExecOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: "ERROR: target is not mounted".to_string(),
            };
        };

        let package_dir = target.join(&package);
        std::fs::create_dir_all(&package_dir).unwrap();
        std::fs::write(package_dir.join("__init__.py"), "").unwrap();
        self.installs.fetch_add(1, Ordering::SeqCst);
        ExecOutput {
            exit_code: 0,
            stdout: format!("Successfully installed {}\n", package),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> bool {
        true
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(RuntimeCall::Create(spec.name.clone()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.fail_create {
            return Err(RuntimeError::Image(format!("no such image: {}", spec.image)));
        }
        let mut state = self.state.lock().unwrap();
        state.live.insert(spec.name.clone(), spec.clone());
        state.max_live = state.max_live.max(state.live.len());
        Ok(format!("id-{}", spec.name))
    }

    async fn exec(
        &self,
        name: &str,
        exec: &ExecSpec,
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        if exec.command.get(2).map(String::as_str) == Some("pip") {
            return Ok(self.pip_install(name, &exec.command).await);
        }

        self.record(RuntimeCall::Run {
            container: name.to_string(),
            python_path: exec.env.get("PYTHONPATH").cloned(),
        });
        if self.run_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RuntimeError::TimedOut(timeout));
        }
        tokio::time::sleep(self.run_delay).await;
        Ok(ExecOutput {
            exit_code: self.exit_code,
            stdout: "ok\n".to_string(),
            stderr: self.stderr.clone(),
        })
    }

    async fn force_kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Kill(name.to_string()));
        tokio::time::sleep(self.kill_delay).await;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Remove(name.to_string()));
        self.state.lock().unwrap().live.remove(name);
        self.orphans.lock().unwrap().retain(|c| c.name != name);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let mut managed = self.orphans.lock().unwrap().clone();
        let state = self.state.lock().unwrap();
        managed.extend(state.live.keys().map(|name| ManagedContainer {
            id: format!("id-{}", name),
            name: name.clone(),
            request_id: None,
            created_at: Some(Utc::now()),
        }));
        Ok(managed)
    }
}

/// Settings pointing the package cache at a fresh temp dir
pub fn test_settings(cache: &TempDir, max_concurrency: usize) -> SandboxSettings {
    SandboxSettings {
        max_concurrency,
        cache_dir: cache.path().to_path_buf(),
        ..SandboxSettings::default()
    }
}

pub fn orchestrator(
    settings: SandboxSettings,
    runtime: &Arc<FakeRuntime>,
) -> Arc<SandboxOrchestrator> {
    let runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    Arc::new(SandboxOrchestrator::new(settings, runtime).expect("orchestrator should build"))
}
