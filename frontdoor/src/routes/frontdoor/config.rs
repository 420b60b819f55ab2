use crate::{
    routes::{ApiError, AppState, Json},
    store::document::DynamicDocument,
};
use axum::extract::State;

/// The merged dynamic document as the proxy consumes it.
pub(crate) async fn handler(state: State<AppState>) -> Result<Json<DynamicDocument>, ApiError> {
    let document = state.orchestrator.merged_document().await?;
    Ok(Json(document))
}
