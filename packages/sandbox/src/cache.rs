// ABOUTME: Shared on-disk package cache with per-key install locks and atomic publish
// ABOUTME: Entries are installed into private staging directories and renamed into place once complete

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::resolver::{normalize_package_name, DependencySpec};

/// File whose presence marks a directory as a complete, published entry
pub const PUBLISHED_MARKER: &str = ".neuroforge-published";

/// Directory under the cache root holding in-progress installs
pub const STAGING_DIR: &str = ".staging";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid package spec: {0}")]
    InvalidSpec(String),

    #[error("Install of {package} failed: {reason}")]
    InstallFailed { package: String, reason: String },

    #[error("Install of {package} timed out after {after:?}")]
    InstallTimedOut { package: String, after: Duration },

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Identity of a cache entry: normalized package name plus a path-safe version slug
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub name: String,
    pub slug: String,
}

impl CacheKey {
    pub fn for_spec(spec: &DependencySpec) -> Self {
        Self {
            name: normalize_package_name(&spec.package),
            slug: version_slug(spec.constraint.as_deref()),
        }
    }
}

/// `latest` when unpinned, the version for a plain `==` pin, a hash otherwise
fn version_slug(constraint: Option<&str>) -> String {
    let Some(constraint) = constraint else {
        return "latest".to_string();
    };
    if let Some(version) = constraint.strip_prefix("==") {
        let path_safe = !version.is_empty()
            && !version.starts_with('.')
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));
        if path_safe {
            return version.to_string();
        }
    }
    let digest = Sha256::digest(constraint.as_bytes());
    format!("h-{}", &hex::encode(digest)[..16])
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    key: CacheKey,
    requirement: String,
    published_at: DateTime<Utc>,
}

/// A published entry ready to be put on a module search path
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub key: CacheKey,
    pub package: String,
    pub host_path: PathBuf,
    /// False when an existing entry was reused
    pub freshly_installed: bool,
}

/// Installs one package into an empty directory
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, spec: &DependencySpec, target: &Path) -> Result<()>;
}

pub struct PackageCache {
    root: PathBuf,
    locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackageCache {
    /// Open a cache rooted at `root`, creating it if needed.
    ///
    /// Leftover staging directories from an earlier process are removed;
    /// the cache assumes it is the only writer under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            for entry in std::fs::read_dir(&staging)? {
                let path = entry?.path();
                debug!("Removing abandoned staging dir {}", path.display());
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!("Failed to remove abandoned staging dir {}: {}", path.display(), e);
                }
            }
        }
        std::fs::create_dir_all(&staging)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.name).join(&key.slug)
    }

    /// Published entry for `key`, without taking any lock
    pub async fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.entry_path(key);
        is_published(&path, key).await.then_some(path)
    }

    /// Return the published entry for `spec`, installing it first if absent.
    ///
    /// Concurrent callers for one key share a single install: the first
    /// takes the key lock and installs, the rest wait on it and then find the
    /// published entry.
    pub async fn fetch_or_install(
        &self,
        spec: &DependencySpec,
        installer: &dyn PackageInstaller,
    ) -> Result<CachedArtifact> {
        spec.validate()
            .map_err(|e| CacheError::InvalidSpec(e.to_string()))?;

        let key = CacheKey::for_spec(spec);
        let dest = self.entry_path(&key);

        if is_published(&dest, &key).await {
            debug!("Cache hit for {} at {}", spec, dest.display());
            return Ok(self.artifact(spec, key, dest, false));
        }

        let _lock = self.lock_key(&key).await;

        if is_published(&dest, &key).await {
            debug!("{} was published while waiting for its lock", spec);
            return Ok(self.artifact(spec, key, dest, false));
        }

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            warn!("Evicting unpublished cache entry {}", dest.display());
            tokio::fs::remove_dir_all(&dest).await?;
        }

        let mut staging = StagingDir::create(&self.root).await?;
        info!("Installing {} into {}", spec, staging.path.display());
        installer.install(spec, &staging.path).await?;

        let manifest = Manifest {
            key: key.clone(),
            requirement: spec.requirement(),
            published_at: Utc::now(),
        };
        tokio::fs::write(
            staging.path.join(PUBLISHED_MARKER),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = tokio::fs::rename(&staging.path, &dest).await {
            if is_published(&dest, &key).await {
                debug!("Lost publish race for {}: {}", spec, e);
                return Ok(self.artifact(spec, key, dest, false));
            }
            return Err(e.into());
        }
        staging.disarm();
        info!("Published {} at {}", spec, dest.display());
        Ok(self.artifact(spec, key, dest, true))
    }

    fn artifact(&self, spec: &DependencySpec, key: CacheKey, host_path: PathBuf, fresh: bool) -> CachedArtifact {
        CachedArtifact {
            key,
            package: spec.package.clone(),
            host_path,
            freshly_installed: fresh,
        }
    }

    async fn lock_key(&self, key: &CacheKey) -> KeyLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        KeyLock {
            cache: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock, for tests and diagnostics
    pub fn active_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held for the duration of an install; drops its map entry when unused
struct KeyLock<'a> {
    cache: &'a PackageCache,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .cache
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Private install directory removed on drop unless published
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    async fn create(root: &Path) -> Result<Self> {
        let path = root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path, armed: true })
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staging dir {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

async fn is_published(path: &Path, key: &CacheKey) -> bool {
    match tokio::fs::read(path.join(PUBLISHED_MARKER)).await {
        Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes)
            .map(|m| &m.key == key)
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FileInstaller {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PackageInstaller for FileInstaller {
        async fn install(&self, spec: &DependencySpec, target: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(target.join("partial.py"), b"x = 1").await?;
            if self.fail {
                return Err(CacheError::InstallFailed {
                    package: spec.package.clone(),
                    reason: "No matching distribution".to_string(),
                });
            }
            tokio::fs::write(target.join(format!("{}.py", spec.package)), b"").await?;
            Ok(())
        }
    }

    fn installer(fail: bool) -> FileInstaller {
        FileInstaller {
            calls: AtomicUsize::new(0),
            fail,
        }
    }

    #[test]
    fn test_version_slugs() {
        assert_eq!(version_slug(None), "latest");
        assert_eq!(version_slug(Some("==1.26.4")), "1.26.4");
        let hashed = version_slug(Some(">=2,<3"));
        assert!(hashed.starts_with("h-"));
        assert_eq!(hashed.len(), 18);
        assert!(version_slug(Some("==../../etc")).starts_with("h-"));
    }

    #[tokio::test]
    async fn test_install_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let inst = installer(false);
        let spec = DependencySpec::new("numpy");

        let first = cache.fetch_or_install(&spec, &inst).await.unwrap();
        assert!(first.freshly_installed);
        assert!(first.host_path.join("numpy.py").exists());
        assert!(first.host_path.join(PUBLISHED_MARKER).exists());

        let second = cache.fetch_or_install(&spec, &inst).await.unwrap();
        assert!(!second.freshly_installed);
        assert_eq!(inst.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_failed_install_leaves_key_absent() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let spec = DependencySpec::new("numpyy");

        let err = cache.fetch_or_install(&spec, &installer(true)).await.unwrap_err();
        assert!(matches!(err, CacheError::InstallFailed { .. }));

        let key = CacheKey::for_spec(&spec);
        assert!(cache.lookup(&key).await.is_none());
        assert!(!cache.entry_path(&key).exists());
        let staging: Vec<_> = std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().collect();
        assert!(staging.is_empty());

        // a later attempt retries cleanly
        let ok = cache.fetch_or_install(&spec, &installer(false)).await.unwrap();
        assert!(ok.freshly_installed);
    }

    #[tokio::test]
    async fn test_unpublished_entry_is_evicted() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let spec = DependencySpec::new("requests");
        let key = CacheKey::for_spec(&spec);

        let stale = cache.entry_path(&key);
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("half_written.py"), b"").unwrap();
        assert!(cache.lookup(&key).await.is_none());

        let inst = installer(false);
        let artifact = cache.fetch_or_install(&spec, &inst).await.unwrap();
        assert!(artifact.freshly_installed);
        assert!(!artifact.host_path.join("half_written.py").exists());
        assert_eq!(inst.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_installer() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let inst = installer(false);
        let spec = DependencySpec::new("numpy; rm -rf /");
        assert!(matches!(
            cache.fetch_or_install(&spec, &inst).await,
            Err(CacheError::InvalidSpec(_))
        ));
        assert_eq!(inst.calls.load(Ordering::SeqCst), 0);
    }
}
