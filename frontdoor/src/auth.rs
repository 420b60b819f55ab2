use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use frontdoor_models::errors::RequestHandlerError;
use std::sync::Arc;

/// The bearer token every `/api` caller must present.
#[derive(Clone)]
pub struct ApiToken(Arc<str>);

impl ApiToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    fn accepts(&self, authorization: Option<&header::HeaderValue>) -> bool {
        let Some(value) = authorization.and_then(|header| header.to_str().ok()) else {
            return false;
        };
        value.strip_prefix("Bearer ").is_some_and(|presented| presented == self.0.as_ref())
    }
}

/// Middleware guarding the API routes. Anything without the configured
/// bearer token is turned away with a structured 401 before it reaches a
/// handler.
pub async fn require_bearer(State(token): State<ApiToken>, request: Request, next: Next) -> Response {
    if token.accepts(request.headers().get(header::AUTHORIZATION)) {
        return next.run(request).await;
    }
    let payload = RequestHandlerError::new("invalid or missing bearer token", "UNAUTHORIZED");
    (StatusCode::UNAUTHORIZED, axum::Json(payload)).into_response()
}
