use crate::routes::{ApiError, AppState, Json};
use axum::extract::State;
use frontdoor_models::frontdoor::add_subdomain::{AddSubdomainRequest, AddSubdomainResponse};

pub(crate) async fn handler(
    state: State<AppState>,
    request: Json<AddSubdomainRequest>,
) -> Result<Json<AddSubdomainResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .add_mongodb_subdomain(&request.subdomain, &request.target_ip, request.agent_id.as_deref())
        .await?;
    Ok(Json(AddSubdomainResponse {
        domain: outcome.domain,
        mongodb_url: outcome.mongodb_url,
        tls_passthrough: outcome.tls_passthrough,
    }))
}
