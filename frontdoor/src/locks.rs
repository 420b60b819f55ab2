use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{fs, time::sleep};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock '{id}'")]
    Timeout { id: String, timeout: Duration },

    #[error("lock '{id}' io failure: {source}")]
    Io { id: String, source: io::Error },
}

/// Advisory inter-process locks materialized as exclusively created files
/// containing the holder's PID. A lock file older than the stale threshold is
/// reclaimed: it is deleted and the next exclusive create wins.
#[derive(Clone, Debug)]
pub struct LockManager {
    dir: PathBuf,
    stale_threshold: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), stale_threshold: DEFAULT_STALE_THRESHOLD }
    }

    #[cfg(test)]
    fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Poll until the lock file can be created exclusively or the timeout elapses.
    pub async fn acquire(&self, id: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let path = self.lock_path(id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.reclaim_if_stale(id, &path).await?;
            match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => {
                    let pid = std::process::id().to_string();
                    if let Err(e) = fs::write(&path, pid).await {
                        let _ = fs::remove_file(&path).await;
                        return Err(LockError::Io { id: id.into(), source: e });
                    }
                    debug!("Acquired lock '{id}'");
                    return Ok(LockGuard { path, id: id.into(), released: false });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(LockError::Timeout { id: id.into(), timeout });
                    }
                    sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(LockError::Io { id: id.into(), source: e }),
            }
        }
    }

    async fn reclaim_if_stale(&self, id: &str, path: &Path) -> Result<(), LockError> {
        let modified = match fs::metadata(path).await {
            Ok(metadata) => metadata.modified().map_err(|source| LockError::Io { id: id.into(), source })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(LockError::Io { id: id.into(), source }),
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age >= self.stale_threshold {
            warn!("Reclaiming stale lock '{id}' (age {age:?})");
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(LockError::Io { id: id.into(), source }),
            }
        }
        Ok(())
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        let name = crate::paths::sanitize_file_name(id);
        self.dir.join(format!("{name}.lock"))
    }
}

/// Releases the lock on drop; `release` is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    id: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!("Released lock '{}'", self.id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release lock '{}': {e}", self.id),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to release lock '{}' on drop: {e}", self.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_manager() -> (LockManager, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        (LockManager::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let (manager, dir) = make_manager();
        let guard = manager.acquire("agent:alpha", Duration::from_secs(1)).await.expect("failed to acquire");
        let lock_path = dir.path().join("agentalpha.lock");
        assert!(lock_path.exists());
        let contents = std::fs::read_to_string(&lock_path).expect("failed to read lock file");
        assert_eq!(contents, std::process::id().to_string());

        guard.release().await;
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let (manager, _dir) = make_manager();
        let _guard = manager.acquire("beta", Duration::from_secs(1)).await.expect("failed to acquire");

        let err = manager.acquire("beta", Duration::from_millis(250)).await.expect_err("acquired held lock");
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn second_holder_wins_after_release() {
        let (manager, _dir) = make_manager();
        let guard = manager.acquire("gamma", Duration::from_secs(1)).await.expect("failed to acquire");
        guard.release().await;
        let _second = manager.acquire("gamma", Duration::from_millis(250)).await.expect("failed to re-acquire");
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let (manager, _dir) = make_manager();
        let manager = manager.with_stale_threshold(Duration::from_millis(50));
        let guard = manager.acquire("delta", Duration::from_secs(1)).await.expect("failed to acquire");
        // Keep the file on disk but forget the guard, simulating a crashed holder.
        std::mem::forget(guard);

        sleep(Duration::from_millis(80)).await;
        let _reclaimed = manager.acquire("delta", Duration::from_secs(1)).await.expect("failed to reclaim");
    }

    #[tokio::test]
    async fn drop_releases_lock() {
        let (manager, dir) = make_manager();
        {
            let _guard = manager.acquire("epsilon", Duration::from_secs(1)).await.expect("failed to acquire");
        }
        assert!(!dir.path().join("epsilon.lock").exists());
    }
}
