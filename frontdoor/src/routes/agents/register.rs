use crate::routes::{ApiError, AppState, Json};
use axum::extract::{ConnectInfo, State};
use frontdoor_models::agents::register::{RegisterAgentRequest, RegisterAgentResponse};
use std::net::SocketAddr;
use tracing::info;

/// Register an agent under the mongo domain. The route target defaults to
/// the caller's remote address, which is the common case for agents phoning
/// home from their own host.
pub(crate) async fn handler(
    state: State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Json<RegisterAgentRequest>,
) -> Result<Json<RegisterAgentResponse>, ApiError> {
    let target_ip = match &request.target_ip {
        Some(ip) => ip.clone(),
        None => remote.ip().to_string(),
    };
    info!("Registering agent '{}' with target {target_ip}", request.agent_id);
    let outcome = state.orchestrator.register_agent(&request.agent_id, &target_ip).await?;
    Ok(Json(RegisterAgentResponse {
        mongodb_url: outcome.mongodb_url,
        tls_posture: outcome.tls_posture.to_string(),
        certificate_issued: outcome.certificate_issued,
    }))
}
