use crate::{
    clients::openssl::{CertTool, CertToolError, CsrRequest, SelfSignedCaRequest, SignRequest},
    locks::{LockError, LockManager},
    paths::PathResolver,
    resilience::{
        breaker::{BreakerError, CircuitBreaker, RateLimit},
        retry::{BulkOptions, bulk},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

pub const CA_KEY_BITS: u32 = 4096;
pub const LEAF_KEY_BITS: u32 = 2048;
pub const CA_VALIDITY_DAYS: u32 = 3650;
pub const LEAF_VALIDITY_DAYS: u32 = 825;
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

pub const CLASS_ISSUE: &str = "issue";
pub const CLASS_RENEW: &str = "renew";
pub const CLASS_REVOKE: &str = "revoke";

const CA_SUBJECT: &str = "/CN=FrontDoor Internal CA/O=FrontDoor";
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

/// The admission budgets for certificate operations.
pub fn certificate_rate_limits() -> HashMap<String, RateLimit> {
    HashMap::from([
        (CLASS_ISSUE.to_string(), RateLimit::per_hour(5)),
        (CLASS_RENEW.to_string(), RateLimit::per_hour(10)),
        (CLASS_REVOKE.to_string(), RateLimit::per_hour(3)),
    ])
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("certificate io: {0}")]
    Io(#[from] io::Error),

    #[error("certificate build: {0}")]
    Build(#[from] CertToolError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateMetadata {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub common_name: Option<String>,
    pub san_dns: Vec<String>,
    pub san_ips: Vec<String>,
}

impl CertificateMetadata {
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// The renewal target: the first SAN IP that is not loopback.
    pub fn renewal_ip(&self) -> Option<&str> {
        self.san_ips.iter().map(String::as_str).find(|ip| *ip != "127.0.0.1")
    }
}

/// One agent's on-disk certificate, as found by a scan. `metadata` is absent
/// when the leaf does not parse; `error` carries the reason.
#[derive(Clone, Debug)]
pub struct AgentCertificateRecord {
    pub agent_id: String,
    pub cert_path: PathBuf,
    pub metadata: Option<CertificateMetadata>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenewScanOptions {
    pub force_all: bool,
    pub renew_before_days: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RenewAction {
    Renewed,
    Skipped,
    Failed,
}

#[derive(Clone, Debug)]
pub struct AgentRenewStatus {
    pub agent_id: String,
    pub action: RenewAction,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RenewScanReport {
    pub checked: u64,
    pub renewed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub statuses: Vec<AgentRenewStatus>,
}

#[derive(Clone, Debug)]
pub struct CertificateValidation {
    pub agent_id: String,
    pub issues: Vec<String>,
}

impl CertificateValidation {
    pub fn valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// The certificate lifecycle: a local CA, per-agent leaves, distribution to
/// the proxy, renewal and revocation. Every operation is admitted through the
/// certificate breaker; mutating operations hold the agent's advisory lock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateService: Send + Sync {
    /// Create the CA key and self-signed certificate if absent. Idempotent.
    async fn bootstrap_ca(&self) -> Result<(), CertificateError>;

    /// Issue (or re-issue) the leaf material for an agent and sync it to the proxy.
    async fn issue_agent(&self, agent_id: String, target_ip: String) -> Result<(), CertificateError>;

    /// Re-issue every leaf whose expiry is within the renewal window.
    async fn renew_scan(&self, options: RenewScanOptions) -> Result<RenewScanReport, CertificateError>;

    /// Remove an agent's material and re-sync. Returns whether anything existed.
    async fn revoke(&self, agent_id: String) -> Result<bool, CertificateError>;

    /// Copy the CA and the combined PEMs into the proxy's filesystem.
    async fn sync_to_proxy(&self) -> Result<(), CertificateError>;

    /// One issue per failing predicate; an empty list means the material is good.
    async fn validate(&self, agent_id: String) -> Result<CertificateValidation, CertificateError>;

    /// Every agent certificate on disk, parse failures included.
    async fn list_certificates(&self) -> Result<Vec<AgentCertificateRecord>, CertificateError>;
}

#[derive(Clone, Debug)]
struct AgentCertPaths {
    dir: PathBuf,
    key: PathBuf,
    cert: PathBuf,
    pem: PathBuf,
    csr: PathBuf,
    ext: PathBuf,
    ca: PathBuf,
}

impl AgentCertPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            key: dir.join("server.key"),
            cert: dir.join("server.crt"),
            pem: dir.join("server.pem"),
            csr: dir.join("server.csr"),
            ext: dir.join("server.ext"),
            ca: dir.join("ca.crt"),
            dir,
        }
    }
}

pub struct CertificateServiceArgs {
    pub paths: PathResolver,
    pub locks: LockManager,
    pub tool: Arc<dyn CertTool>,
    pub breaker: Arc<CircuitBreaker>,

    /// Where the proxy reads certificates from (a volume shared with the
    /// proxy container).
    pub proxy_certs_dir: PathBuf,
}

pub struct DefaultCertificateService {
    paths: PathResolver,
    locks: LockManager,
    tool: Arc<dyn CertTool>,
    breaker: Arc<CircuitBreaker>,
    proxy_certs_dir: PathBuf,
}

impl DefaultCertificateService {
    pub fn new(args: CertificateServiceArgs) -> Self {
        let CertificateServiceArgs { paths, locks, tool, breaker, proxy_certs_dir } = args;
        Self { paths, locks, tool, breaker, proxy_certs_dir }
    }

    async fn ensure_ca(&self) -> Result<(), CertificateError> {
        let key_path = self.paths.ca_key_path();
        let cert_path = self.paths.ca_cert_path();
        if !try_exists(&key_path).await? || !try_exists(&cert_path).await? {
            info!("Bootstrapping certificate authority at {}", cert_path.display());
            fs::create_dir_all(self.paths.certs_dir()).await?;
            self.tool.generate_key(key_path.clone(), CA_KEY_BITS).await?;
            set_mode(&key_path, PRIVATE_MODE).await?;
            self.tool
                .self_signed_ca(SelfSignedCaRequest {
                    key_path,
                    cert_path: cert_path.clone(),
                    subject: CA_SUBJECT.into(),
                    days: CA_VALIDITY_DAYS,
                })
                .await?;
            set_mode(&cert_path, PUBLIC_MODE).await?;
        }
        self.ensure_mongodb_ca_symlink().await
    }

    async fn ensure_mongodb_ca_symlink(&self) -> Result<(), CertificateError> {
        let link = self.paths.mongodb_ca_path();
        if fs::symlink_metadata(&link).await.is_ok() {
            return Ok(());
        }
        fs::symlink("ca.crt", &link).await?;
        Ok(())
    }

    async fn issue_locked(&self, agent_id: &str, target_ip: &str) -> Result<(), CertificateError> {
        self.ensure_ca().await?;
        let paths = AgentCertPaths::new(self.paths.agent_cert_dir(agent_id));
        fs::create_dir_all(&paths.dir).await?;

        self.tool.generate_key(paths.key.clone(), LEAF_KEY_BITS).await?;
        set_mode(&paths.key, PRIVATE_MODE).await?;

        fs::write(&paths.ext, extensions_file(agent_id, target_ip)).await?;
        set_mode(&paths.ext, PUBLIC_MODE).await?;

        self.tool
            .create_csr(CsrRequest {
                key_path: paths.key.clone(),
                csr_path: paths.csr.clone(),
                subject: format!("/CN={agent_id}"),
            })
            .await?;
        self.tool
            .sign(SignRequest {
                csr_path: paths.csr.clone(),
                ca_cert_path: self.paths.ca_cert_path(),
                ca_key_path: self.paths.ca_key_path(),
                serial_path: self.paths.ca_serial_path(),
                cert_path: paths.cert.clone(),
                ext_file_path: paths.ext.clone(),
                days: LEAF_VALIDITY_DAYS,
            })
            .await?;
        set_mode(&paths.cert, PUBLIC_MODE).await?;

        fs::copy(self.paths.ca_cert_path(), &paths.ca).await?;
        set_mode(&paths.ca, PUBLIC_MODE).await?;

        let key = fs::read(&paths.key).await?;
        let cert = fs::read(&paths.cert).await?;
        fs::write(&paths.pem, combined_pem(&key, &cert)).await?;
        set_mode(&paths.pem, PRIVATE_MODE).await?;

        info!("Issued certificate for agent '{agent_id}' (SAN IP {target_ip})");
        self.sync_agent_to_proxy(agent_id, &paths).await
    }

    async fn sync_agent_to_proxy(&self, agent_id: &str, paths: &AgentCertPaths) -> Result<(), CertificateError> {
        let proxy_agents = self.proxy_certs_dir.join("agents");
        fs::create_dir_all(&proxy_agents).await?;
        let target = proxy_agents.join(format!("{agent_id}.pem"));
        fs::copy(&paths.pem, &target).await?;
        set_mode(&target, PRIVATE_MODE).await?;
        Ok(())
    }

    async fn sync_all_to_proxy(&self) -> Result<(), CertificateError> {
        let proxy_agents = self.proxy_certs_dir.join("agents");
        fs::create_dir_all(&proxy_agents).await?;
        let ca = self.paths.ca_cert_path();
        if try_exists(&ca).await? {
            for name in ["ca.crt", "mongodb-ca.crt"] {
                let target = self.proxy_certs_dir.join(name);
                fs::copy(&ca, &target).await?;
                set_mode(&target, PUBLIC_MODE).await?;
            }
        }
        let mut copies = Vec::new();
        for record in self.scan_disk().await? {
            let paths = AgentCertPaths::new(self.paths.agent_cert_dir(&record.agent_id));
            if try_exists(&paths.pem).await? {
                copies.push((paths.pem, proxy_agents.join(format!("{}.pem", record.agent_id))));
            }
        }
        let copied = copies.len();
        let output = bulk(copies, BulkOptions { concurrency: 4, stop_on_error: false }, |(source, target)| async move {
            fs::copy(&source, &target).await?;
            set_mode(&target, PRIVATE_MODE).await?;
            Ok::<_, io::Error>(())
        })
        .await;
        if let Some(e) = output.errors.into_iter().next() {
            return Err(e.into());
        }
        info!("Synced CA and {copied} agent PEM(s) to proxy filesystem");
        Ok(())
    }

    async fn scan_disk(&self) -> Result<Vec<AgentCertificateRecord>, CertificateError> {
        let mut records = Vec::new();
        let dir = self.paths.agent_certs_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(agent_id) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            let cert_path = entry.path().join("server.crt");
            let record = match fs::read(&cert_path).await {
                Ok(bytes) => match parse_certificate_pem(&bytes) {
                    Ok(metadata) => {
                        AgentCertificateRecord { agent_id, cert_path, metadata: Some(metadata), error: None }
                    }
                    Err(reason) => AgentCertificateRecord { agent_id, cert_path, metadata: None, error: Some(reason) },
                },
                Err(e) => AgentCertificateRecord {
                    agent_id,
                    cert_path,
                    metadata: None,
                    error: Some(format!("unreadable: {e}")),
                },
            };
            records.push(record);
        }
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    async fn with_breaker<T, Fut>(&self, class: Option<&str>, fut: Fut) -> Result<T, CertificateError>
    where
        Fut: Future<Output = Result<T, CertificateError>>,
    {
        self.breaker.admit(class)?;
        match fut.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CertificateService for DefaultCertificateService {
    async fn bootstrap_ca(&self) -> Result<(), CertificateError> {
        self.with_breaker(None, self.ensure_ca()).await
    }

    async fn issue_agent(&self, agent_id: String, target_ip: String) -> Result<(), CertificateError> {
        self.breaker.admit(Some(CLASS_ISSUE))?;
        let guard = self.locks.acquire(&format!("cert:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = self.issue_locked(&agent_id, &target_ip).await;
        guard.release().await;
        match result {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn renew_scan(&self, options: RenewScanOptions) -> Result<RenewScanReport, CertificateError> {
        let renew_before_days = options.renew_before_days.unwrap_or(DEFAULT_RENEW_BEFORE_DAYS);
        let now = Utc::now();
        let mut report = RenewScanReport::default();

        for record in self.list_certificates().await? {
            report.checked += 1;
            let agent_id = record.agent_id.clone();

            let Some(metadata) = record.metadata else {
                report.failed += 1;
                report.statuses.push(AgentRenewStatus { agent_id, action: RenewAction::Failed, detail: record.error });
                continue;
            };
            let days = metadata.days_until_expiry(now);
            if !options.force_all && days > renew_before_days {
                report.skipped += 1;
                report.statuses.push(AgentRenewStatus {
                    agent_id,
                    action: RenewAction::Skipped,
                    detail: Some(format!("{days} day(s) left")),
                });
                continue;
            }
            let Some(target_ip) = metadata.renewal_ip().map(ToString::to_string) else {
                report.failed += 1;
                report.statuses.push(AgentRenewStatus {
                    agent_id,
                    action: RenewAction::Failed,
                    detail: Some("no renewal IP in SAN".into()),
                });
                continue;
            };
            if let Err(e) = self.breaker.admit(Some(CLASS_RENEW)) {
                report.failed += 1;
                report.statuses.push(AgentRenewStatus { agent_id, action: RenewAction::Failed, detail: Some(e.to_string()) });
                continue;
            }

            let guard = self.locks.acquire(&format!("cert:{agent_id}"), LOCK_TIMEOUT).await?;
            let result = self.issue_locked(&agent_id, &target_ip).await;
            guard.release().await;
            match result {
                Ok(()) => {
                    self.breaker.record_success();
                    report.renewed += 1;
                    report.statuses.push(AgentRenewStatus { agent_id, action: RenewAction::Renewed, detail: None });
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!("Failed to renew certificate for agent '{agent_id}': {e}");
                    report.failed += 1;
                    report.statuses.push(AgentRenewStatus {
                        agent_id,
                        action: RenewAction::Failed,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }
        info!(
            "Renewal scan done: {} checked, {} renewed, {} skipped, {} failed",
            report.checked, report.renewed, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn revoke(&self, agent_id: String) -> Result<bool, CertificateError> {
        self.breaker.admit(Some(CLASS_REVOKE))?;
        let guard = self.locks.acquire(&format!("cert:{agent_id}"), LOCK_TIMEOUT).await?;
        let dir = self.paths.agent_cert_dir(&agent_id);
        let result = async {
            let existed = match fs::remove_dir_all(&dir).await {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(CertificateError::from(e)),
            };
            let proxy_pem = self.proxy_certs_dir.join("agents").join(format!("{agent_id}.pem"));
            match fs::remove_file(&proxy_pem).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertificateError::from(e)),
            }
            Ok(existed)
        }
        .await;
        guard.release().await;
        match result {
            Ok(existed) => {
                self.breaker.record_success();
                if existed {
                    info!("Revoked certificate material for agent '{agent_id}'");
                }
                Ok(existed)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn sync_to_proxy(&self) -> Result<(), CertificateError> {
        self.with_breaker(None, self.sync_all_to_proxy()).await
    }

    async fn validate(&self, agent_id: String) -> Result<CertificateValidation, CertificateError> {
        let paths = AgentCertPaths::new(self.paths.agent_cert_dir(&agent_id));
        let mut issues = Vec::new();
        for (path, what) in [
            (&paths.key, "private key"),
            (&paths.cert, "leaf certificate"),
            (&paths.pem, "combined PEM"),
            (&paths.ca, "CA copy"),
        ] {
            if !try_exists(path).await? {
                issues.push(format!("{what} missing at {}", path.display()));
            }
        }
        if try_exists(&paths.cert).await? {
            match parse_certificate_pem(&fs::read(&paths.cert).await?) {
                Ok(metadata) => {
                    if metadata.common_name.as_deref() != Some(agent_id.as_str()) {
                        issues.push(format!(
                            "common name '{}' does not match agent id",
                            metadata.common_name.unwrap_or_default()
                        ));
                    }
                    if metadata.not_after <= Utc::now() {
                        issues.push(format!("certificate expired at {}", metadata.not_after));
                    }
                }
                Err(reason) => issues.push(format!("leaf certificate does not parse: {reason}")),
            }
        }
        let proxy_pem = self.proxy_certs_dir.join("agents").join(format!("{agent_id}.pem"));
        if !try_exists(&proxy_pem).await? {
            issues.push(format!("proxy PEM missing at {}", proxy_pem.display()));
        }
        Ok(CertificateValidation { agent_id, issues })
    }

    async fn list_certificates(&self) -> Result<Vec<AgentCertificateRecord>, CertificateError> {
        self.scan_disk().await
    }
}

/// The SAN extensions applied when signing an agent leaf.
fn extensions_file(agent_id: &str, target_ip: &str) -> String {
    format!(
        "authorityKeyIdentifier=keyid,issuer\n\
         basicConstraints=CA:FALSE\n\
         keyUsage = digitalSignature, nonRepudiation, keyEncipherment, dataEncipherment\n\
         subjectAltName = @alt_names\n\
         \n\
         [alt_names]\n\
         IP.1 = {target_ip}\n\
         IP.2 = 127.0.0.1\n\
         DNS.1 = {agent_id}\n\
         DNS.2 = localhost\n"
    )
}

/// key ‖ leaf, with a separating newline if the key does not end in one.
fn combined_pem(key: &[u8], cert: &[u8]) -> Vec<u8> {
    let mut pem = Vec::with_capacity(key.len() + cert.len() + 1);
    pem.extend_from_slice(key);
    if !key.ends_with(b"\n") {
        pem.push(b'\n');
    }
    pem.extend_from_slice(cert);
    pem
}

pub fn parse_certificate_pem(bytes: &[u8]) -> Result<CertificateMetadata, String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(bytes).map_err(|e| format!("pem: {e}"))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents).map_err(|e| format!("der: {e}"))?;

    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| "notBefore out of range".to_string())?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| "notAfter out of range".to_string())?;
    let common_name =
        cert.subject().iter_common_name().next().and_then(|cn| cn.as_str().ok()).map(ToString::to_string);

    let mut san_dns = Vec::new();
    let mut san_ips = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(name) => san_dns.push(name.to_string()),
                GeneralName::IPAddress(bytes) => {
                    let ip: Option<IpAddr> = match bytes.len() {
                        4 => <[u8; 4]>::try_from(*bytes).ok().map(|b| IpAddr::from(b)),
                        16 => <[u8; 16]>::try_from(*bytes).ok().map(|b| IpAddr::from(b)),
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        san_ips.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(CertificateMetadata { not_before, not_after, common_name, san_dns, san_ips })
}

async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

async fn try_exists(path: &Path) -> io::Result<bool> {
    fs::try_exists(path).await
}
