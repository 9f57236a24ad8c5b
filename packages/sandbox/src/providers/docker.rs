// ABOUTME: Docker implementation of the container runtime
// ABOUTME: Uses bollard to create locked-down sandbox containers, exec commands in them and tear them down

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{
    ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, ManagedContainer, Result, RuntimeError,
    LABEL_PREFIX,
};

/// Keeps the container alive between exec calls
const KEEPALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

pub struct DockerRuntime {
    client: Docker,
    /// Images known to be present locally
    pulled_images: Arc<RwLock<HashSet<String>>>,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect with default settings and a 10 minute image pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            pulled_images: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout,
        }
    }

    /// Translate a spec into a bollard config with the sandbox hardening applied
    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
        labels.insert(format!("{}.name", LABEL_PREFIX), spec.name.clone());

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.container_path,
                    if m.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_bytes),
            nano_cpus: Some(spec.limits.nano_cpus()),
            pids_limit: Some(spec.limits.pids),
            network_mode: Some(spec.network_mode.as_runtime_str().to_string()),
            tmpfs: spec.limits.tmpfs_size.as_ref().map(|size| {
                HashMap::from([("/tmp".to_string(), format!("rw,size={}", size))])
            }),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Image(e.to_string())),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.pulled_images.read().await.contains(image) {
            return Ok(());
        }
        if self.image_exists(image).await? {
            self.pulled_images.write().await.insert(image.to_string());
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(RuntimeError::Image(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                        if let Some(status) = info.status {
                            if status != last_status {
                                debug!("Pull status: {}", status);
                                last_status = status;
                            }
                        }
                    }
                    Err(e) => {
                        return Err(RuntimeError::Image(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )))
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.pulled_images.write().await.insert(image.to_string());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn run_exec(&self, name: &str, exec: &ExecSpec) -> Result<ExecOutput> {
        let env: Vec<String> = exec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let options = CreateExecOptions {
            cmd: Some(exec.command.clone()),
            env: Some(env),
            working_dir: exec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(name, options)
            .await
            .map_err(|e| map_container_error(name, e))?;

        let started = self
            .client
            .start_exec(&created.id, None)
            .await
            .map_err(|e| map_container_error(name, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            stdout.extend_from_slice(&message)
                        }
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(map_container_error(name, e)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Container(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self
            .client
            .inspect_exec(&created.id)
            .await
            .map_err(|e| map_container_error(name, e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

fn map_container_error(name: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(name.to_string()),
        other => RuntimeError::Container(other.to_string()),
    }
}

/// 404 (gone) and 409 (not running / already being removed) are expected during teardown
fn is_benign_teardown_error(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        info!(
            "Creating container {} from {} (network: {})",
            spec.name, spec.image, spec.network_mode
        );

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| {
                error!("Failed to create container {}: {}", spec.name, e);
                RuntimeError::Container(e.to_string())
            })?;

        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        if let Err(e) = self
            .client
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            error!("Failed to start container {}: {}", spec.name, e);
            if let Err(cleanup) = self.remove(&spec.name).await {
                warn!("Failed to remove unstarted container {}: {}", spec.name, cleanup);
            }
            return Err(RuntimeError::Container(e.to_string()));
        }

        debug!("Started container {} ({})", spec.name, created.id);
        Ok(created.id)
    }

    async fn exec(&self, name: &str, exec: &ExecSpec, timeout: Duration) -> Result<ExecOutput> {
        debug!("Executing in {}: {:?}", name, exec.command);
        match tokio::time::timeout(timeout, self.run_exec(name, exec)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TimedOut(timeout)),
        }
    }

    async fn force_kill(&self, name: &str) -> Result<()> {
        info!("Force killing container {}", name);
        match self
            .client
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_benign_teardown_error(&e) => {
                debug!("Kill of {} skipped: {}", name, e);
                Ok(())
            }
            Err(e) => {
                error!("Failed to kill container {}: {}", name, e);
                Err(RuntimeError::Container(e.to_string()))
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!("Removed container {}", name);
                Ok(())
            }
            Err(e) if is_benign_teardown_error(&e) => {
                debug!("Container {} already gone: {}", name, e);
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove container {}: {}", name, e);
                Err(RuntimeError::Container(e.to_string()))
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}.managed=true", LABEL_PREFIX)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let labels = c.labels.unwrap_or_default();
                let name = labels
                    .get(&format!("{}.name", LABEL_PREFIX))
                    .cloned()
                    .or_else(|| {
                        c.names
                            .and_then(|names| names.into_iter().next())
                            .map(|n| n.trim_start_matches('/').to_string())
                    })
                    .unwrap_or_else(|| id.clone());
                Some(ManagedContainer {
                    id,
                    name,
                    request_id: labels.get(&format!("{}.request", LABEL_PREFIX)).cloned(),
                    created_at: c
                        .created
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
                })
            })
            .collect())
    }
}
