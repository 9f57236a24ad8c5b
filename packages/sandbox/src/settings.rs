// ABOUTME: Environment-driven settings for the sandbox orchestrator
// ABOUTME: Safety-relevant values fail loudly when invalid; tuning values fall back to defaults with a warning

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use neuroforge_config::constants::{
    LOCAL_RUN_TIMEOUT, PIP_CACHE_DIR, SANDBOX_ALLOWED_NETWORKS, SANDBOX_BASE_PACKAGES,
    SANDBOX_CACHE_MOUNT, SANDBOX_CPU_LIMIT, SANDBOX_DEFAULT_NETWORK, SANDBOX_DEFAULT_TIMEOUT_SECS,
    SANDBOX_DEPENDENCY_FAILURE_POLICY, SANDBOX_DOCKER_NETWORK, SANDBOX_EVENT_CHANNEL_SIZE, SANDBOX_INSTALL_TIMEOUT_SECS,
    SANDBOX_MAX_CONCURRENCY, SANDBOX_MAX_QUEUE, SANDBOX_MAX_TIMEOUT_SECS, SANDBOX_MEMORY_LIMIT,
    SANDBOX_PIDS_LIMIT, SANDBOX_QUEUE_TIMEOUT_SECS, SANDBOX_SCREEN_CODE, SANDBOX_TMPFS_SIZE,
};
use neuroforge_config::{flag, list, parse_in_range, parse_or, string, EnvSource, ProcessEnv};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SandboxError};
use crate::network::{NetworkMode, NetworkPolicy};
use crate::types::{parse_memory_size, Language, ResourceLimits};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_QUEUE: usize = 64;
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;
pub const DEFAULT_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CACHE_MOUNT: &str = "/opt/neuroforge/packages";
pub const DEFAULT_BASE_PACKAGES: [&str; 3] = ["pip", "setuptools", "wheel"];

/// What to do when some packages in an install plan fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyFailurePolicy {
    /// Fail the request with a dependency error
    #[default]
    Abort,
    /// Run anyway with whatever installed, reporting the failures
    Proceed,
}

impl FromStr for DependencyFailurePolicy {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "fail" => Ok(Self::Abort),
            "proceed" | "degraded" | "continue" => Ok(Self::Proceed),
            other => Err(SandboxError::Configuration(format!(
                "Unknown dependency failure policy: {:?} (expected abort or proceed)",
                other
            ))),
        }
    }
}

impl fmt::Display for DependencyFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Proceed => f.write_str("proceed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    // Admission
    pub max_concurrency: usize,
    pub max_queue: usize,
    pub queue_timeout: Duration,
    /// Capacity of the lifecycle event broadcast channel
    pub event_channel_size: usize,

    // Network
    pub network: NetworkPolicy,

    // Package cache
    pub cache_dir: PathBuf,
    /// Where the cache directory is mounted inside containers
    pub cache_mount: String,
    pub base_packages: Vec<String>,
    pub install_timeout: Duration,
    pub dependency_failure_policy: DependencyFailurePolicy,

    // Containers
    pub limits: ResourceLimits,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub screen_code: bool,
    pub images: HashMap<Language, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_queue: DEFAULT_MAX_QUEUE,
            queue_timeout: Duration::from_secs(DEFAULT_QUEUE_TIMEOUT_SECS),
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
            network: NetworkPolicy::default(),
            cache_dir: default_cache_dir(),
            cache_mount: DEFAULT_CACHE_MOUNT.to_string(),
            base_packages: DEFAULT_BASE_PACKAGES.iter().map(|s| s.to_string()).collect(),
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
            dependency_failure_policy: DependencyFailurePolicy::Abort,
            limits: ResourceLimits::default(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(DEFAULT_MAX_TIMEOUT_SECS),
            screen_code: false,
            images: Language::ALL
                .iter()
                .map(|lang| (*lang, lang.default_image().to_string()))
                .collect(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("neuroforge-pip-cache")
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn EnvSource) -> Result<Self> {
        let defaults = Self::default();

        let max_concurrency = match string(env, SANDBOX_MAX_CONCURRENCY) {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    SandboxError::Configuration(format!(
                        "{} must be a positive integer, got {:?}",
                        SANDBOX_MAX_CONCURRENCY, raw
                    ))
                })?,
            None => defaults.max_concurrency,
        };

        let network = {
            let default_mode = match string(env, SANDBOX_DEFAULT_NETWORK) {
                Some(raw) => raw.parse::<NetworkMode>()?,
                None => NetworkMode::None,
            };
            let runner_override = string(env, SANDBOX_DOCKER_NETWORK)
                .map(|raw| raw.parse::<NetworkMode>())
                .transpose()?;
            let allowed = match list(env, SANDBOX_ALLOWED_NETWORKS) {
                Some(items) => items
                    .iter()
                    .map(|item| item.parse::<NetworkMode>())
                    .collect::<Result<Vec<_>>>()?,
                None => defaults.network.allowed().to_vec(),
            };
            NetworkPolicy::new(default_mode, runner_override, allowed)?
        };

        let cache_mount =
            string(env, SANDBOX_CACHE_MOUNT).unwrap_or_else(|| DEFAULT_CACHE_MOUNT.to_string());
        if !cache_mount.starts_with('/') {
            return Err(SandboxError::Configuration(format!(
                "{} must be an absolute container path, got {:?}",
                SANDBOX_CACHE_MOUNT, cache_mount
            )));
        }

        let dependency_failure_policy = match string(env, SANDBOX_DEPENDENCY_FAILURE_POLICY) {
            Some(raw) => raw.parse()?,
            None => DependencyFailurePolicy::Abort,
        };

        let max_timeout_secs =
            parse_in_range(env, SANDBOX_MAX_TIMEOUT_SECS, DEFAULT_MAX_TIMEOUT_SECS, 1..=3600);
        let default_timeout_secs = match string(env, SANDBOX_DEFAULT_TIMEOUT_SECS) {
            Some(_) => parse_in_range(env, SANDBOX_DEFAULT_TIMEOUT_SECS, DEFAULT_TIMEOUT_SECS, 1..=3600),
            None => parse_in_range(env, LOCAL_RUN_TIMEOUT, DEFAULT_TIMEOUT_SECS, 1..=3600),
        }
        .min(max_timeout_secs);

        let images = Language::ALL
            .iter()
            .map(|lang| {
                let image = string(env, lang.image_env())
                    .unwrap_or_else(|| lang.default_image().to_string());
                (*lang, image)
            })
            .collect();

        Ok(Self {
            max_concurrency,
            max_queue: parse_or(env, SANDBOX_MAX_QUEUE, defaults.max_queue),
            queue_timeout: Duration::from_secs(parse_in_range(
                env,
                SANDBOX_QUEUE_TIMEOUT_SECS,
                DEFAULT_QUEUE_TIMEOUT_SECS,
                1..=3600,
            )),
            event_channel_size: parse_in_range(
                env,
                SANDBOX_EVENT_CHANNEL_SIZE,
                DEFAULT_EVENT_CHANNEL_SIZE,
                10..=10_000,
            ),
            network,
            cache_dir: string(env, PIP_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_mount,
            base_packages: list(env, SANDBOX_BASE_PACKAGES).unwrap_or(defaults.base_packages),
            install_timeout: Duration::from_secs(parse_in_range(
                env,
                SANDBOX_INSTALL_TIMEOUT_SECS,
                DEFAULT_INSTALL_TIMEOUT_SECS,
                1..=3600,
            )),
            dependency_failure_policy,
            limits: limits_from_env(env),
            default_timeout: Duration::from_secs(default_timeout_secs),
            max_timeout: Duration::from_secs(max_timeout_secs),
            screen_code: flag(env, SANDBOX_SCREEN_CODE, false),
            images,
        })
    }

    /// Timeout for a request, rejecting values outside `1..=max_timeout`
    pub fn effective_timeout(&self, requested_secs: Option<u64>) -> Result<Duration> {
        match requested_secs {
            None => Ok(self.default_timeout),
            Some(0) => Err(SandboxError::Configuration(
                "Timeout must be greater than zero".to_string(),
            )),
            Some(secs) if Duration::from_secs(secs) > self.max_timeout => {
                Err(SandboxError::Configuration(format!(
                    "Timeout {}s exceeds the maximum of {}s",
                    secs,
                    self.max_timeout.as_secs()
                )))
            }
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub fn image_for(&self, language: Language) -> &str {
        self.images
            .get(&language)
            .map(String::as_str)
            .unwrap_or_else(|| language.default_image())
    }
}

fn limits_from_env(env: &dyn EnvSource) -> ResourceLimits {
    let defaults = ResourceLimits::default();

    let memory_bytes = match string(env, SANDBOX_MEMORY_LIMIT) {
        Some(raw) => parse_memory_size(&raw).unwrap_or_else(|_| {
            warn!("Ignoring invalid {} {:?}", SANDBOX_MEMORY_LIMIT, raw);
            defaults.memory_bytes
        }),
        None => defaults.memory_bytes,
    };

    let cpus = parse_or(env, SANDBOX_CPU_LIMIT, defaults.cpus);
    let cpus = if cpus.is_finite() && cpus > 0.0 {
        cpus
    } else {
        warn!("Ignoring non-positive {} {}", SANDBOX_CPU_LIMIT, cpus);
        defaults.cpus
    };

    let tmpfs_size = string(env, SANDBOX_TMPFS_SIZE).filter(|raw| {
        let valid = parse_memory_size(raw).is_ok();
        if !valid {
            warn!("Ignoring invalid {} {:?}", SANDBOX_TMPFS_SIZE, raw);
        }
        valid
    });

    let limits = ResourceLimits {
        memory_bytes,
        cpus,
        pids: parse_in_range(env, SANDBOX_PIDS_LIMIT, defaults.pids, 1..=32768),
        tmpfs_size,
    };

    match limits.validate() {
        Ok(()) => limits,
        Err(e) => {
            warn!("Resource limits from environment rejected ({}), using defaults", e);
            defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = SandboxSettings::from_source(&env(&[])).unwrap();
        assert_eq!(settings.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(settings.network.deployment_default(), NetworkMode::None);
        assert_eq!(settings.default_timeout, Duration::from_secs(8));
        assert_eq!(settings.dependency_failure_policy, DependencyFailurePolicy::Abort);
        assert_eq!(settings.image_for(Language::Cpp), "gcc:13");
        assert_eq!(settings.limits.pids, 64);
    }

    #[test]
    fn test_invalid_concurrency_is_rejected() {
        for raw in ["0", "-1", "many"] {
            let err = SandboxSettings::from_source(&env(&[(SANDBOX_MAX_CONCURRENCY, raw)]))
                .unwrap_err();
            assert!(matches!(err, SandboxError::Configuration(_)), "{}", raw);
        }
    }

    #[test]
    fn test_invalid_network_is_rejected() {
        assert!(SandboxSettings::from_source(&env(&[(SANDBOX_DEFAULT_NETWORK, "host")])).is_err());
        assert!(SandboxSettings::from_source(&env(&[(SANDBOX_DOCKER_NETWORK, "weird")])).is_err());
        assert!(SandboxSettings::from_source(&env(&[
            (SANDBOX_DEFAULT_NETWORK, "bridge"),
            (SANDBOX_ALLOWED_NETWORKS, "none"),
        ]))
        .is_err());
    }

    #[test]
    fn test_runner_override_sets_deployment_default() {
        let settings = SandboxSettings::from_source(&env(&[
            (SANDBOX_DEFAULT_NETWORK, "none"),
            (SANDBOX_DOCKER_NETWORK, "bridge"),
        ]))
        .unwrap();
        assert_eq!(settings.network.deployment_default(), NetworkMode::Bridge);
    }

    #[test]
    fn test_tuning_values_fall_back() {
        let settings = SandboxSettings::from_source(&env(&[
            (SANDBOX_MEMORY_LIMIT, "lots"),
            (SANDBOX_CPU_LIMIT, "-2"),
            (SANDBOX_TMPFS_SIZE, "64m"),
            (SANDBOX_QUEUE_TIMEOUT_SECS, "0"),
            (LOCAL_RUN_TIMEOUT, "12"),
        ]))
        .unwrap();
        assert_eq!(settings.limits.memory_bytes, ResourceLimits::default().memory_bytes);
        assert_eq!(settings.limits.cpus, 1.0);
        assert_eq!(settings.limits.tmpfs_size.as_deref(), Some("64m"));
        assert_eq!(settings.queue_timeout, Duration::from_secs(30));
        assert_eq!(settings.default_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_dependency_policy_parsing() {
        let settings =
            SandboxSettings::from_source(&env(&[(SANDBOX_DEPENDENCY_FAILURE_POLICY, "proceed")]))
                .unwrap();
        assert_eq!(settings.dependency_failure_policy, DependencyFailurePolicy::Proceed);
        assert!(
            SandboxSettings::from_source(&env(&[(SANDBOX_DEPENDENCY_FAILURE_POLICY, "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn test_effective_timeout_bounds() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.effective_timeout(None).unwrap(), Duration::from_secs(8));
        assert_eq!(settings.effective_timeout(Some(30)).unwrap(), Duration::from_secs(30));
        assert!(settings.effective_timeout(Some(0)).is_err());
        assert!(settings.effective_timeout(Some(31)).is_err());
    }
}
