// ABOUTME: Package installer that runs pip inside the request's own container
// ABOUTME: Installs into the cache's staging directory through the read/write cache mount

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use neuroforge_memory::trace_signature;
use tracing::debug;

use crate::cache::{CacheError, PackageInstaller, Result};
use crate::providers::{ContainerRuntime, ExecSpec, RuntimeError};
use crate::resolver::DependencySpec;

pub struct ContainerInstaller<'a> {
    runtime: &'a dyn ContainerRuntime,
    container: &'a str,
    cache_root: &'a Path,
    mount_point: &'a str,
    timeout: Duration,
}

impl<'a> ContainerInstaller<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        container: &'a str,
        cache_root: &'a Path,
        mount_point: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            container,
            cache_root,
            mount_point,
            timeout,
        }
    }

    /// Path of a host directory under the cache root as seen inside the container
    pub fn container_path(&self, host_path: &Path) -> Result<String> {
        container_path(self.cache_root, self.mount_point, host_path)
    }

    fn pip_command(target: &str, spec: &DependencySpec) -> ExecSpec {
        ExecSpec {
            command: [
                "python",
                "-m",
                "pip",
                "install",
                "--no-cache-dir",
                "--disable-pip-version-check",
                "--no-input",
                "--target",
                target,
            ]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(spec.requirement()))
            .collect(),
            ..Default::default()
        }
    }
}

/// Map `host_path` under `cache_root` to the same entry under `mount_point`
pub fn container_path(cache_root: &Path, mount_point: &str, host_path: &Path) -> Result<String> {
    let relative = host_path.strip_prefix(cache_root).map_err(|_| {
        CacheError::InvalidSpec(format!(
            "{} is outside the cache root {}",
            host_path.display(),
            cache_root.display()
        ))
    })?;
    let mut path = mount_point.trim_end_matches('/').to_string();
    for component in relative.components() {
        path.push('/');
        path.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(path)
}

#[async_trait]
impl PackageInstaller for ContainerInstaller<'_> {
    async fn install(&self, spec: &DependencySpec, target: &Path) -> Result<()> {
        let container_target = self.container_path(target)?;
        debug!(
            "Installing {} in {} into {}",
            spec, self.container, container_target
        );

        let exec = Self::pip_command(&container_target, spec);
        match self.runtime.exec(self.container, &exec, self.timeout).await {
            Ok(output) if output.exit_code == 0 => Ok(()),
            Ok(output) => Err(CacheError::InstallFailed {
                package: spec.package.clone(),
                reason: trace_signature(&output.stderr),
            }),
            Err(RuntimeError::TimedOut(after)) => Err(CacheError::InstallTimedOut {
                package: spec.package.clone(),
                after,
            }),
            Err(e) => Err(CacheError::InstallFailed {
                package: spec.package.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_container_path_mapping() {
        let root = PathBuf::from("/var/cache/nf");
        let mapped = container_path(
            &root,
            "/opt/neuroforge/packages/",
            &root.join(".staging").join("abc"),
        )
        .unwrap();
        assert_eq!(mapped, "/opt/neuroforge/packages/.staging/abc");
        assert!(container_path(&root, "/opt/p", Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_pip_command_targets_staging() {
        let spec = DependencySpec::new("numpy").with_constraint("==1.26.4");
        let exec = ContainerInstaller::pip_command("/opt/p/.staging/x", &spec);
        assert_eq!(exec.command.last().map(String::as_str), Some("numpy==1.26.4"));
        assert!(exec
            .command
            .windows(2)
            .any(|w| w[0] == "--target" && w[1] == "/opt/p/.staging/x"));
    }
}
