use crate::routes::{ApiError, AppState, Json};
use axum::extract::State;
use frontdoor_models::frontdoor::add_app::{AddAppRequest, AddAppResponse};

pub(crate) async fn handler(
    state: State<AppState>,
    request: Json<AddAppRequest>,
) -> Result<Json<AddAppResponse>, ApiError> {
    let outcome =
        state.orchestrator.add_app_route(&request.subdomain, &request.target_url, request.agent_id.as_deref()).await?;
    Ok(Json(AddAppResponse { domain: outcome.domain, target_url: outcome.target_url }))
}
