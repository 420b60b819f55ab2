use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const CONTAINER_MARKERS: &[&str] = &["/.dockerenv", "/run/.containerenv"];
const CONTAINER_DEFAULT_BASE: &str = "/app";
const HOST_DEFAULT_BASE: &str = "/opt/frontdoor";
const FALLBACK_DIR_NAME: &str = ".frontdoor";
const PROBE_FILE_NAME: &str = ".write-test";

/// Where the process is running, which decides the default filesystem layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionEnvironment {
    Host,
    Container,
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("no usable base directory, tried: {}", candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    Unusable { candidates: Vec<PathBuf> },

    #[error("failed to create directory layout under {path}: {source}")]
    Layout { path: PathBuf, source: io::Error },
}

/// Resolves and owns the canonical filesystem layout:
///
/// ```text
/// <base>/config/dynamic.yml
/// <base>/config/agents/<agent-id>.yml
/// <base>/config/certs/...
/// <base>/config/locks/<id>.lock
/// ```
#[derive(Clone, Debug)]
pub struct PathResolver {
    base: PathBuf,
    environment: ExecutionEnvironment,
}

impl PathResolver {
    /// Pick the first candidate base directory that is both creatable and writable.
    ///
    /// Candidate order: configured override, container default (when containerized),
    /// host default, home fallback.
    pub fn resolve(configured: Option<PathBuf>) -> Result<Self, PathError> {
        let environment = detect_environment();
        let mut candidates = Vec::new();
        if let Some(path) = configured {
            candidates.push(path);
        }
        if environment == ExecutionEnvironment::Container {
            candidates.push(PathBuf::from(CONTAINER_DEFAULT_BASE));
        }
        candidates.push(PathBuf::from(HOST_DEFAULT_BASE));
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(FALLBACK_DIR_NAME));
        }

        for candidate in &candidates {
            match verify_writable(candidate) {
                Ok(()) => {
                    info!("Using base directory {} ({environment:?})", candidate.display());
                    let resolver = Self { base: candidate.clone(), environment };
                    resolver.ensure_layout()?;
                    return Ok(resolver);
                }
                Err(e) => {
                    debug!("Base directory candidate {} rejected: {e}", candidate.display());
                }
            }
        }
        Err(PathError::Unusable { candidates })
    }

    /// Build a resolver rooted at an explicit directory, creating the layout underneath.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Result<Self, PathError> {
        let resolver = Self { base: base.into(), environment: detect_environment() };
        resolver.ensure_layout()?;
        Ok(resolver)
    }

    fn ensure_layout(&self) -> Result<(), PathError> {
        for dir in [self.agents_dir(), self.agent_certs_dir(), self.locks_dir()] {
            fs::create_dir_all(&dir).map_err(|source| PathError::Layout { path: dir.clone(), source })?;
        }
        Ok(())
    }

    pub fn environment(&self) -> ExecutionEnvironment {
        self.environment
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base.join("config")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.config_dir().join("agents")
    }

    pub fn dynamic_doc_path(&self) -> PathBuf {
        self.config_dir().join("dynamic.yml")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.config_dir().join("certs")
    }

    pub fn agent_certs_dir(&self) -> PathBuf {
        self.certs_dir().join("agents")
    }

    pub fn agent_cert_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_certs_dir().join(sanitize_file_name(agent_id))
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir().join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.certs_dir().join("ca.key")
    }

    pub fn ca_serial_path(&self) -> PathBuf {
        self.certs_dir().join("ca.srl")
    }

    /// The name MongoDB hosts expect the CA under; a symlink to `ca.crt`.
    pub fn mongodb_ca_path(&self) -> PathBuf {
        self.certs_dir().join("mongodb-ca.crt")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.config_dir().join("locks")
    }

    pub fn fragment_path(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(format!("{}.yml", sanitize_file_name(agent_id)))
    }
}

/// Strip anything that is not safe in a file name. Agent ids already match
/// `[a-zA-Z0-9_-]+` at the boundary so this is only a second line of defense.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_')).collect()
}

fn detect_environment() -> ExecutionEnvironment {
    for marker in CONTAINER_MARKERS {
        if Path::new(marker).exists() {
            return ExecutionEnvironment::Container;
        }
    }
    if let Ok(cgroup) = fs::read_to_string("/proc/1/cgroup") {
        if ["docker", "containerd", "kubepods"].iter().any(|needle| cgroup.contains(needle)) {
            return ExecutionEnvironment::Container;
        }
    }
    ExecutionEnvironment::Host
}

fn verify_writable(base: &Path) -> io::Result<()> {
    fs::create_dir_all(base)?;
    let probe = base.join(PROBE_FILE_NAME);
    fs::write(&probe, b"probe")?;
    fs::remove_file(&probe)?;
    Ok(())
}
