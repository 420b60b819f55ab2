pub mod document;

use crate::{
    locks::{LockError, LockManager},
    paths::PathResolver,
    resilience::retry::{RetryPolicy, retry_if},
};
use chrono::Utc;
use self::document::{DynamicDocument, RouteFragment};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const PUBLIC_FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("atomic rename would cross filesystems for {path}")]
    CrossFilesystem { path: PathBuf },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_yaml::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Owns the two layers of routing persistence: one fragment file per agent
/// and the merged dynamic document the proxy consumes. Writers serialize on
/// advisory locks; readers rely on atomic renames for consistency.
#[derive(Clone)]
pub struct ConfigStore {
    paths: PathResolver,
    locks: LockManager,
    mongo_domain: String,
}

impl ConfigStore {
    pub fn new(paths: PathResolver, locks: LockManager, mongo_domain: impl Into<String>) -> Self {
        Self { paths, locks, mongo_domain: mongo_domain.into() }
    }

    pub fn dynamic_doc_path(&self) -> PathBuf {
        self.paths.dynamic_doc_path()
    }

    /// Persist an agent's fragment, then rebuild the merged document from all
    /// fragments on disk. Returns the merged view that was written.
    pub async fn save_fragment(&self, agent_id: &str, fragment: &RouteFragment) -> Result<DynamicDocument, StoreError> {
        let path = self.paths.fragment_path(agent_id);
        let guard = self.locks.acquire(&format!("config:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = write_atomic(&path, fragment);
        guard.release().await;
        result?;
        self.rebuild_dynamic_document().await
    }

    /// Load an agent's fragment. A corrupt file is quarantined and reported
    /// as absent; the original bytes stay on disk under a sidecar name.
    pub async fn load_fragment(&self, agent_id: &str) -> Result<Option<RouteFragment>, StoreError> {
        let path = self.paths.fragment_path(agent_id);
        match read_validated::<RouteFragment>(&path)? {
            ReadOutcome::Found(fragment) => Ok(Some(fragment)),
            ReadOutcome::Missing => Ok(None),
            ReadOutcome::Quarantined { sidecar } => {
                warn!("Fragment for agent '{agent_id}' was corrupt, moved to {}", sidecar.display());
                Ok(None)
            }
        }
    }

    /// Remove an agent's fragment and rebuild the merged document. Removing a
    /// fragment that does not exist is not an error.
    pub async fn delete_fragment(&self, agent_id: &str) -> Result<bool, StoreError> {
        let path = self.paths.fragment_path(agent_id);
        let guard = self.locks.acquire(&format!("config:{agent_id}"), LOCK_TIMEOUT).await?;
        let existed = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                guard.release().await;
                return Err(e.into());
            }
        };
        guard.release().await;
        self.rebuild_dynamic_document().await?;
        Ok(existed)
    }

    /// All fragments on disk, keyed by sanitized agent file stem. Corrupt
    /// fragments are quarantined and skipped.
    pub async fn list_fragments(&self) -> Result<BTreeMap<String, RouteFragment>, StoreError> {
        let mut fragments = BTreeMap::new();
        let dir = self.paths.agents_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(fragments),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match read_validated::<RouteFragment>(&path)? {
                ReadOutcome::Found(fragment) => {
                    fragments.insert(stem.to_string(), fragment);
                }
                ReadOutcome::Missing => {}
                ReadOutcome::Quarantined { sidecar } => {
                    warn!("Skipping corrupt fragment {}, quarantined at {}", path.display(), sidecar.display());
                }
            }
        }
        Ok(fragments)
    }

    /// Merge every fragment over the skeleton and atomically replace the
    /// dynamic document. This is the linearization point for readers. A
    /// failed write is retried once before surfacing.
    pub async fn rebuild_dynamic_document(&self) -> Result<DynamicDocument, StoreError> {
        let fragments = self.list_fragments().await?;
        let document = DynamicDocument::merged(&self.mongo_domain, fragments.values());
        let path = self.paths.dynamic_doc_path();
        let guard = self.locks.acquire("config:dynamic", LOCK_TIMEOUT).await?;
        let policy = RetryPolicy::new(1, Duration::from_millis(100), Duration::from_millis(500));
        let result = retry_if(
            &policy,
            |e: &StoreError, _| matches!(e, StoreError::Io(_)),
            || async { write_atomic(&path, &document) },
        )
        .await;
        guard.release().await;
        result.map_err(|e| e.source)?;
        info!(
            "Rebuilt dynamic document with {} tcp and {} http routers",
            document.tcp.routers.len(),
            document.http.routers.len()
        );
        Ok(document)
    }

    /// Read the merged document; corruption quarantines the bytes and
    /// regenerates a valid default in place.
    pub async fn load_dynamic_document(&self) -> Result<DynamicDocument, StoreError> {
        let path = self.paths.dynamic_doc_path();
        match read_validated::<DynamicDocument>(&path)? {
            ReadOutcome::Found(mut document) => {
                document.ensure_defaults(&self.mongo_domain);
                Ok(document)
            }
            ReadOutcome::Missing => self.rebuild_dynamic_document().await,
            ReadOutcome::Quarantined { sidecar } => {
                warn!("Dynamic document was corrupt, quarantined at {}; regenerating", sidecar.display());
                self.rebuild_dynamic_document().await
            }
        }
    }
}

enum ReadOutcome<T> {
    Found(T),
    Missing,
    Quarantined { sidecar: PathBuf },
}

fn read_validated<T: DeserializeOwned>(path: &Path) -> Result<ReadOutcome<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(e.into()),
    };
    match serde_yaml::from_slice(&bytes) {
        Ok(value) => Ok(ReadOutcome::Found(value)),
        Err(e) => {
            let sidecar = quarantine(path, &e.to_string())?;
            Ok(ReadOutcome::Quarantined { sidecar })
        }
    }
}

/// Move unparseable bytes aside without deleting them.
fn quarantine(path: &Path, reason: &str) -> Result<PathBuf, StoreError> {
    let sidecar = PathBuf::from(format!("{}.corrupted.{}", path.display(), Utc::now().timestamp()));
    warn!("Quarantining corrupt document {} ({reason})", path.display());
    std::fs::rename(path, &sidecar)?;
    Ok(sidecar)
}

/// Crash-safe replace: serialize into a sibling temp file, validate by
/// re-parsing the serialized bytes, fix the mode, then rename over the target.
fn write_atomic<T: Serialize + DeserializeOwned>(path: &Path, value: &T) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let parent = path.parent().ok_or_else(|| StoreError::Corrupt {
        path: path.into(),
        reason: "target path has no parent directory".into(),
    })?;
    std::fs::create_dir_all(parent)?;

    let serialized = serde_yaml::to_string(value)?;
    if let Err(e) = serde_yaml::from_str::<T>(&serialized) {
        return Err(StoreError::Corrupt { path: path.into(), reason: format!("serialized bytes do not re-parse: {e}") });
    }

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut temp, serialized.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.as_file().set_permissions(std::fs::Permissions::from_mode(PUBLIC_FILE_MODE))?;
    temp.persist(path).map_err(|e| match e.error.kind() {
        io::ErrorKind::CrossesDevices => StoreError::CrossFilesystem { path: path.into() },
        _ => StoreError::Io(e.error),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (ConfigStore, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let paths = PathResolver::rooted_at(dir.path()).expect("failed to resolve paths");
        let locks = LockManager::new(paths.locks_dir());
        (ConfigStore::new(paths, locks, "mongodb.example.com"), dir)
    }

    #[tokio::test]
    async fn save_fragment_rebuilds_merged_document() {
        let (store, _dir) = make_store();
        let fragment = RouteFragment::default().with_mongodb_route("alpha", "mongodb.example.com", "10.0.0.7", 27017, true);
        let merged = store.save_fragment("alpha", &fragment).await.expect("failed to save");

        assert!(merged.tcp.routers.contains_key("alpha-mongodb"));
        assert!(merged.has_catchall());

        let on_disk: DynamicDocument =
            serde_yaml::from_str(&std::fs::read_to_string(store.dynamic_doc_path()).expect("no document")).expect("bad yaml");
        assert_eq!(on_disk, merged);
    }

    #[tokio::test]
    async fn dynamic_document_mode_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let (store, _dir) = make_store();
        store.rebuild_dynamic_document().await.expect("failed to rebuild");
        let mode = std::fs::metadata(store.dynamic_doc_path()).expect("no metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn delete_fragment_removes_routes() {
        let (store, _dir) = make_store();
        let fragment = RouteFragment::default().with_mongodb_route("alpha", "mongodb.example.com", "10.0.0.7", 27017, true);
        store.save_fragment("alpha", &fragment).await.expect("failed to save");

        assert!(store.delete_fragment("alpha").await.expect("failed to delete"));
        let merged = store.load_dynamic_document().await.expect("failed to load");
        assert!(!merged.tcp.routers.contains_key("alpha-mongodb"));
        assert!(merged.has_catchall());

        // Idempotent.
        assert!(!store.delete_fragment("alpha").await.expect("second delete failed"));
    }

    #[tokio::test]
    async fn corrupt_document_is_quarantined_and_regenerated() {
        let (store, _dir) = make_store();
        let path = store.dynamic_doc_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{{{ not yaml").expect("failed to write garbage");

        let document = store.load_dynamic_document().await.expect("failed to load");
        assert!(document.has_catchall());

        let sidecars: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .expect("failed to read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupted."))
            .collect();
        assert_eq!(sidecars.len(), 1);
        let preserved = std::fs::read(sidecars[0].path()).expect("sidecar unreadable");
        assert_eq!(preserved, b"{{{ not yaml");
    }

    #[tokio::test]
    async fn corrupt_fragment_is_skipped_not_fatal() {
        let (store, _dir) = make_store();
        let good = RouteFragment::default().with_mongodb_route("alpha", "mongodb.example.com", "10.0.0.7", 27017, true);
        store.save_fragment("alpha", &good).await.expect("failed to save");
        std::fs::write(store.paths.fragment_path("beta"), b":\n:::").expect("failed to write garbage");

        let fragments = store.list_fragments().await.expect("failed to list");
        assert!(fragments.contains_key("alpha"));
        assert!(!fragments.contains_key("beta"));

        assert!(store.load_fragment("beta").await.expect("load failed").is_none());
    }

    #[tokio::test]
    async fn missing_document_is_created_on_load() {
        let (store, _dir) = make_store();
        assert!(!store.dynamic_doc_path().exists());
        let document = store.load_dynamic_document().await.expect("failed to load");
        assert!(document.has_catchall());
        assert!(store.dynamic_doc_path().exists());
    }
}
