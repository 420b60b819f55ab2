use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime statistics for one backend pool, as reported by the proxy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub backend: String,
    pub servers: Vec<ServerStats>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub name: String,
    pub address: String,
    pub current_connections: u64,
    pub max_connections: u64,

    /// Recent average response time; absent for L4 pools without timing data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,

    pub queue_length: u64,
    pub error_count: u64,
    pub total_sessions: u64,
    pub up: bool,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRuntime {
    pub backend: String,
    pub name: String,
    pub weight: u32,
}

#[derive(Clone, Debug, Deserialize)]
struct TransactionHandle {
    id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyAdminError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The proxy's admin API: health, stats, reload, and the transactional
/// server-weight surface used by the load optimizer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyAdminClient: Send + Sync {
    async fn check_health(&self) -> Result<(), ProxyAdminError>;

    async fn read_stats(&self) -> Result<Vec<BackendStats>, ProxyAdminError>;

    /// Open a configuration transaction and return its id.
    async fn begin_transaction(&self) -> Result<String, ProxyAdminError>;

    async fn read_server(&self, transaction: String, backend: String, server: String) -> Result<ServerRuntime, ProxyAdminError>;

    async fn update_server_weight(
        &self,
        transaction: String,
        backend: String,
        server: String,
        weight: u32,
    ) -> Result<(), ProxyAdminError>;

    async fn commit_transaction(&self, transaction: String) -> Result<(), ProxyAdminError>;

    async fn abort_transaction(&self, transaction: String) -> Result<(), ProxyAdminError>;

    /// Ask the proxy to re-read its dynamic configuration.
    async fn signal_reload(&self) -> Result<(), ProxyAdminError>;
}

pub struct DefaultProxyAdminClient {
    client: Client,
    base_url: String,
}

impl DefaultProxyAdminClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build().context("Failed to build reqwest client")?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProxyAdminError> {
        let endpoint = self.endpoint(path);
        debug!("Sending request to {endpoint}");
        let response = self.client.get(endpoint).send().await?.error_for_status()?.json().await?;
        Ok(response)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProxyAdminError> {
        let endpoint = self.endpoint(path);
        debug!("Sending request to {endpoint}");
        let response = self.client.post(endpoint).send().await?.error_for_status()?.json().await?;
        Ok(response)
    }
}

#[async_trait]
impl ProxyAdminClient for DefaultProxyAdminClient {
    async fn check_health(&self) -> Result<(), ProxyAdminError> {
        self.client.get(self.endpoint("/health")).send().await?.error_for_status()?;
        Ok(())
    }

    async fn read_stats(&self) -> Result<Vec<BackendStats>, ProxyAdminError> {
        self.get("/stats/backends").await
    }

    async fn begin_transaction(&self) -> Result<String, ProxyAdminError> {
        let handle: TransactionHandle = self.post("/transactions").await?;
        Ok(handle.id)
    }

    async fn read_server(&self, transaction: String, backend: String, server: String) -> Result<ServerRuntime, ProxyAdminError> {
        self.get(&format!("/transactions/{transaction}/backends/{backend}/servers/{server}")).await
    }

    async fn update_server_weight(
        &self,
        transaction: String,
        backend: String,
        server: String,
        weight: u32,
    ) -> Result<(), ProxyAdminError> {
        let endpoint = self.endpoint(&format!("/transactions/{transaction}/backends/{backend}/servers/{server}"));
        debug!("Sending request to {endpoint}");
        self.client.put(endpoint).json(&serde_json::json!({ "weight": weight })).send().await?.error_for_status()?;
        Ok(())
    }

    async fn commit_transaction(&self, transaction: String) -> Result<(), ProxyAdminError> {
        let endpoint = self.endpoint(&format!("/transactions/{transaction}/commit"));
        self.client.post(endpoint).send().await?.error_for_status()?;
        Ok(())
    }

    async fn abort_transaction(&self, transaction: String) -> Result<(), ProxyAdminError> {
        let endpoint = self.endpoint(&format!("/transactions/{transaction}"));
        self.client.delete(endpoint).send().await?.error_for_status()?;
        Ok(())
    }

    async fn signal_reload(&self) -> Result<(), ProxyAdminError> {
        let endpoint = self.endpoint("/reload");
        debug!("Sending reload signal to {endpoint}");
        self.client.post(endpoint).timeout(RELOAD_TIMEOUT).send().await?.error_for_status()?;
        Ok(())
    }
}
