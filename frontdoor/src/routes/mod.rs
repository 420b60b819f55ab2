use crate::{
    auth::{ApiToken, require_bearer},
    config::DomainsConfig,
    locks::LockError,
    repositories::agent::AgentRepository,
    resilience::breaker::{BreakerError, CircuitBreaker},
    services::{
        certificates::CertificateError,
        lifecycle::ProxyLifecycle,
        orchestrator::{Orchestrator, OrchestratorError},
    },
    store::StoreError,
};
use axum::Router;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use frontdoor_models::errors::RequestHandlerError;
use serde::{Serialize, de::DeserializeOwned};
use std::ops::Deref;
use std::sync::Arc;
use tracing::error;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

pub(crate) mod agents;
pub(crate) mod frontdoor;
pub(crate) mod mongodb;
pub(crate) mod status;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub lifecycle: Arc<ProxyLifecycle>,
    pub agents: Arc<dyn AgentRepository>,
    pub breakers: Vec<Arc<CircuitBreaker>>,
    pub domains: DomainsConfig,
    pub started_at: std::time::Instant,
}

pub fn build_router(state: AppState, token: String) -> Router {
    Router::new().route("/health", get(health)).nest(
        "/api",
        Router::new()
            .route("/agent/register", post(agents::register::handler))
            .route("/frontdoor/add-subdomain", post(frontdoor::add_subdomain::handler))
            .route("/frontdoor/add-app", post(frontdoor::add_app::handler))
            .route("/frontdoor/config", get(frontdoor::config::handler))
            .route("/mongodb/{agent_id}", delete(mongodb::remove::handler))
            .route("/mongodb/{agent_id}/test", get(mongodb::test::handler))
            .route("/status", get(status::handler))
            .with_state(state)
            .layer(middleware::from_fn_with_state(ApiToken::new(token), require_bearer)),
    )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Maps the orchestrator's error taxonomy onto HTTP codes with stable kind
/// tags; every failing handler funnels through this.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub(crate) struct ApiError(#[from] pub(crate) OrchestratorError);

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            OrchestratorError::UnknownAgent(_) => (StatusCode::NOT_FOUND, "UNKNOWN_AGENT"),
            OrchestratorError::Certificate(e) => match e {
                CertificateError::Breaker(BreakerError::Open { .. }) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN")
                }
                CertificateError::Breaker(BreakerError::RateLimited { .. }) => {
                    (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED")
                }
                CertificateError::Lock(LockError::Timeout { .. }) => (StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT"),
                CertificateError::Lock(LockError::Io { .. }) => (StatusCode::INTERNAL_SERVER_ERROR, "LOCK_IO"),
                CertificateError::Build(_) => (StatusCode::BAD_GATEWAY, "CERT_BUILD"),
                CertificateError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CERT_IO"),
            },
            OrchestratorError::Store(e) => match e {
                StoreError::Corrupt { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_CORRUPT"),
                StoreError::CrossFilesystem { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_CROSS_FS"),
                StoreError::Lock(LockError::Timeout { .. }) => (StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_IO"),
            },
            OrchestratorError::Lock(LockError::Timeout { .. }) => (StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT"),
            OrchestratorError::Lock(LockError::Io { .. }) => (StatusCode::INTERNAL_SERVER_ERROR, "LOCK_IO"),
            OrchestratorError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
            OrchestratorError::Recovery(_) => (StatusCode::SERVICE_UNAVAILABLE, "MAX_ATTEMPTS_REACHED"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, kind) = self.classify();
        let message = if code == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:#}", anyhow::Error::from(self.0));
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (code, Json(RequestHandlerError::new(message, kind))).into_response()
    }
}

/// `axum::Json` plus boundary validation: a payload that deserializes but
/// fails its validators comes back as a structured `VALIDATION` rejection
/// instead of reaching the handler.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::Json(payload) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| validation_failure(rejection.status(), rejection.body_text()))?;
        if let Err(errors) = payload.validate() {
            let detail = flatten_validation_errors(&errors).join("; ");
            return Err(validation_failure(StatusCode::BAD_REQUEST, detail));
        }
        Ok(Self(payload))
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

fn validation_failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, axum::Json(RequestHandlerError::new(message, "VALIDATION"))).into_response()
}

/// Reject path parameters that do not look like an agent id before they reach
/// the filesystem or the registry.
pub(crate) fn require_agent_id(agent_id: &str) -> Result<(), Response> {
    if frontdoor_models::validate_agent_id(agent_id).is_ok() {
        return Ok(());
    }
    Err(validation_failure(StatusCode::BAD_REQUEST, format!("'{agent_id}' is not a valid agent id")))
}

/// Walk validator's error tree into flat `field: problem` lines, one per
/// failed check.
fn flatten_validation_errors(errors: &ValidationErrors) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending: Vec<(String, &ValidationErrors)> = vec![(String::new(), errors)];
    while let Some((prefix, errors)) = pending.pop() {
        for (field, kind) in errors.errors() {
            let path = if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") };
            match kind {
                ValidationErrorsKind::Field(failures) => {
                    for failure in failures {
                        lines.push(format!("{path}: {}", describe_failure(failure)));
                    }
                }
                ValidationErrorsKind::Struct(nested) => pending.push((path, nested)),
                ValidationErrorsKind::List(items) => {
                    for (index, nested) in items {
                        pending.push((format!("{path}[{index}]"), nested));
                    }
                }
            }
        }
    }
    lines.sort();
    lines
}

fn describe_failure(failure: &ValidationError) -> String {
    if let Some(message) = &failure.message {
        return message.to_string();
    }
    // Custom validators use a readable sentence as their code.
    match failure.code.as_ref() {
        "length" => "has an invalid length".into(),
        "range" => "is out of range".into(),
        code => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontdoor_models::agents::register::RegisterAgentRequest;
    use frontdoor_models::frontdoor::add_app::AddAppRequest;

    #[test]
    fn validation_errors_flatten_to_field_lines() {
        let request = RegisterAgentRequest { agent_id: "bad/id".into(), target_ip: Some("not-an-ip".into()) };
        let errors = request.validate().expect_err("not an error");
        let lines = flatten_validation_errors(&errors);
        assert_eq!(lines.len(), 2, "{lines:?}");
        assert!(lines.iter().any(|line| line.starts_with("agent_id: ")), "{lines:?}");
        assert!(lines.iter().any(|line| line.starts_with("target_ip: ")), "{lines:?}");
    }

    #[test]
    fn every_failed_check_gets_its_own_line() {
        // An empty subdomain fails both the length and the format check.
        let request = AddAppRequest { subdomain: String::new(), target_url: "http://10.0.0.9".into(), agent_id: None };
        let errors = request.validate().expect_err("not an error");
        let lines = flatten_validation_errors(&errors);
        assert!(lines.len() >= 2, "{lines:?}");
        assert!(lines.iter().all(|line| line.starts_with("subdomain: ")), "{lines:?}");
    }

    #[test]
    fn agent_id_path_guard() {
        require_agent_id("alpha-01").expect("valid id rejected");
        require_agent_id("../etc").expect_err("traversal accepted");
    }

    #[test]
    fn breaker_rejections_map_to_stable_kinds() {
        let open = ApiError(OrchestratorError::Certificate(CertificateError::Breaker(BreakerError::Open {
            name: "certificates".into(),
            retry_in: std::time::Duration::from_secs(30),
        })));
        assert_eq!(open.classify(), (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"));

        let limited = ApiError(OrchestratorError::Certificate(CertificateError::Breaker(BreakerError::RateLimited {
            class: "issue".into(),
        })));
        assert_eq!(limited.classify(), (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"));

        let unknown = ApiError(OrchestratorError::UnknownAgent("ghost".into()));
        assert_eq!(unknown.classify(), (StatusCode::NOT_FOUND, "UNKNOWN_AGENT"));
    }
}
