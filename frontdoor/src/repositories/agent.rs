use crate::services::prober::TlsPosture;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, prelude::FromRow};
use strum::{Display, EnumString};

/// The stored TLS preference for an agent's backend, derived from the last
/// probe classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, sqlx::Type)]
pub enum TlsPreference {
    Required,
    Forbidden,
    #[default]
    Unknown,
}

impl From<TlsPosture> for TlsPreference {
    fn from(posture: TlsPosture) -> Self {
        match posture {
            TlsPosture::Plaintext => Self::Forbidden,
            TlsPosture::TlsRequired | TlsPosture::Ambiguous => Self::Required,
            TlsPosture::Unreachable => Self::Unknown,
        }
    }
}

#[derive(FromRow, Clone, Debug, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub target_ip: String,
    pub target_port: u16,
    pub tls_posture: TlsPreference,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or refresh an agent; `created_at` is preserved on conflict.
    async fn upsert(&self, agent: AgentRecord) -> Result<(), AgentRepositoryError>;

    async fn find(&self, id: String) -> Result<AgentRecord, AgentRepositoryError>;

    async fn list(&self) -> Result<Vec<AgentRecord>, AgentRepositoryError>;

    async fn delete(&self, id: String) -> Result<bool, AgentRepositoryError>;

    async fn count(&self) -> Result<u64, AgentRepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AgentRepositoryError {
    #[error("agent not found")]
    AgentNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn upsert(&self, agent: AgentRecord) -> Result<(), AgentRepositoryError> {
        let query = r"
INSERT INTO agents (id, target_ip, target_port, tls_posture, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (id) DO UPDATE SET
    target_ip = $2,
    target_port = $3,
    tls_posture = $4,
    updated_at = $6
";
        let AgentRecord { id, target_ip, target_port, tls_posture, created_at, updated_at } = agent;
        sqlx::query(query)
            .bind(id)
            .bind(target_ip)
            .bind(target_port)
            .bind(tls_posture.to_string())
            .bind(created_at)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, id: String) -> Result<AgentRecord, AgentRepositoryError> {
        let query = "SELECT * FROM agents WHERE id = ?";
        let agent: AgentRecord =
            sqlx::query_as(query).bind(id).fetch_optional(&self.pool).await?.ok_or(AgentRepositoryError::AgentNotFound)?;
        Ok(agent)
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, AgentRepositoryError> {
        let query = "SELECT * FROM agents ORDER BY id";
        let agents: Vec<AgentRecord> = sqlx::query_as(query).fetch_all(&self.pool).await?;
        Ok(agents)
    }

    async fn delete(&self, id: String) -> Result<bool, AgentRepositoryError> {
        let query = "DELETE FROM agents WHERE id = ?";
        let result = sqlx::query(query).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, AgentRepositoryError> {
        let query = "SELECT COUNT(*) FROM agents";
        let count: i64 = sqlx::query_scalar(query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}
