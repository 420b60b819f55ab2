use crate::routes::{ApiError, AppState, Json, require_agent_id};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use frontdoor_models::mongodb::test::ConnectionTestResponse;

/// Probe an agent's backend and report its TLS posture against the route.
pub(crate) async fn handler(
    state: State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<ConnectionTestResponse>, Response> {
    require_agent_id(&agent_id)?;
    let test = state
        .orchestrator
        .test_agent(&agent_id)
        .await
        .map_err(|e| ApiError::from(e).into_response())?;
    Ok(Json(ConnectionTestResponse {
        agent_id: test.agent_id,
        target: test.target,
        classification: test.posture.to_string(),
        tls_passthrough: test.tls_passthrough,
        recommendations: test.recommendations,
    }))
}
