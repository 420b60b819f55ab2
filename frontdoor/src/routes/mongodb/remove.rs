use crate::routes::{ApiError, AppState, Json, require_agent_id};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use frontdoor_models::mongodb::remove::RemoveAgentResponse;
use tracing::info;

/// Revoke an agent's certificate and remove its route. Idempotent.
pub(crate) async fn handler(
    state: State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<RemoveAgentResponse>, Response> {
    require_agent_id(&agent_id)?;
    info!("Removing agent '{agent_id}'");
    let outcome = state
        .orchestrator
        .remove_agent(&agent_id)
        .await
        .map_err(|e| ApiError::from(e).into_response())?;
    Ok(Json(RemoveAgentResponse { agent_id, certificate_revoked: outcome.certificate_revoked }))
}
