use crate::services::optimizer::OptimizerConfig;
use anyhow::Context;
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Deserialize, Debug)]
pub struct Config {
    /// The parent domains routes are created under.
    pub domains: DomainsConfig,

    /// API configuration.
    pub api: ApiConfig,

    /// The database configuration.
    pub db: DbConfig,

    /// Filesystem layout overrides.
    #[serde(default)]
    pub paths: PathsConfig,

    /// The sibling proxy: admin endpoint, container, recovery policy.
    pub proxy: ProxyConfig,

    /// Certificate authority configuration.
    #[serde(default)]
    pub certificates: CertificatesConfig,

    /// The certificate monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// The load optimizer configuration.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// The metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Reading config file {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| format!("Parsing config file {}", path.display()))
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DomainsConfig {
    /// The parent domain for HTTP application routes.
    pub app: String,

    /// The parent domain for MongoDB SNI routes.
    pub mongo: String,
}

#[derive(Deserialize, Debug)]
pub struct ApiConfig {
    /// The endpoint to bind to.
    pub bind_endpoint: SocketAddr,

    /// The bearer token API callers must present.
    pub token: String,
}

#[derive(Deserialize, Debug)]
pub struct DbConfig {
    /// The database URL.
    pub url: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct PathsConfig {
    /// Overrides the detected base directory.
    pub base: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct ProxyConfig {
    /// The proxy admin API endpoint.
    pub admin_endpoint: String,

    /// Where the proxy reads certificates from.
    pub certs_dir: PathBuf,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default = "default_process_name")]
    pub process_name: String,

    #[serde(default = "default_docker_bin")]
    pub docker_bin: PathBuf,

    /// Command run inside the container when the admin reload fails.
    #[serde(default = "default_service_restart_command")]
    pub service_restart_command: Vec<String>,

    /// Interval for the background health probe.
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Deserialize, Debug)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde", default = "default_backoff_cap")]
    pub backoff_cap: Duration,

    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            grace_period: default_grace_period(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct CertificatesConfig {
    #[serde(default = "default_openssl_bin")]
    pub openssl_bin: PathBuf,

    /// Certificates within this many days of expiry are renewed by the scan.
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    /// Expiry distance that triggers a warning event.
    #[serde(default = "default_warning_days")]
    pub warning_days: i64,

    /// How often the renewal scheduler scans.
    #[serde(with = "humantime_serde", default = "default_renew_check_interval")]
    pub renew_check_interval: Duration,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            openssl_bin: default_openssl_bin(),
            renew_before_days: default_renew_before_days(),
            warning_days: default_warning_days(),
            renew_check_interval: default_renew_check_interval(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct MonitorConfig {
    /// How often the certificate monitor scans.
    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval: default_monitor_interval() }
    }
}

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    /// The endpoint where metrics are exposed.
    pub bind_endpoint: SocketAddr,
}

fn default_container_name() -> String {
    "frontdoor-proxy".into()
}

fn default_process_name() -> String {
    "traefik".into()
}

fn default_docker_bin() -> PathBuf {
    "docker".into()
}

fn default_service_restart_command() -> Vec<String> {
    vec!["sh".into(), "-c".into(), "kill -HUP 1".into()]
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(300)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(3)
}

fn default_openssl_bin() -> PathBuf {
    "openssl".into()
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_warning_days() -> i64 {
    30
}

fn default_renew_check_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(60 * 60)
}
