use crate::routes::{ApiError, AppState, Json};
use axum::extract::State;
use frontdoor_models::status::{BreakerStatus, RecoveryRecord, StatusResponse};

/// Uptime, domains, proxy health, breaker states and recovery history.
pub(crate) async fn handler(state: State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let health = state.lifecycle.health_snapshot();
    let breakers = state
        .breakers
        .iter()
        .map(|breaker| {
            let snapshot = breaker.snapshot();
            BreakerStatus {
                name: snapshot.name,
                state: snapshot.state.to_string(),
                consecutive_failures: snapshot.consecutive_failures,
                last_failure: snapshot.last_failure,
            }
        })
        .collect();
    let recovery_history = state
        .lifecycle
        .recovery_history()
        .into_iter()
        .map(|record| RecoveryRecord {
            timestamp: record.timestamp,
            attempt: record.attempt,
            action: record.action.to_string(),
            success: record.success,
            message: record.message,
        })
        .collect();
    let registered_agents = state.agents.count().await.map_err(crate::services::orchestrator::OrchestratorError::from)?;

    Ok(Json(StatusResponse {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        app_domain: state.domains.app.clone(),
        mongo_domain: state.domains.mongo.clone(),
        proxy_health: health.health.to_string(),
        auto_recovery_enabled: state.lifecycle.auto_recovery_enabled(),
        breakers,
        recovery_history,
        registered_agents,
    }))
}
