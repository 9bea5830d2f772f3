use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::api::error::ApiError;
use crate::core::AppState;

/// Bearer-token check for the control surface. Local and remote callers
/// authenticate the same way; token management is the operator's concern.
pub async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(state.cfg.auth.token.as_str()) {
        Ok(next.run(req).await)
    } else {
        Err(ApiError::Unauthorized)
    }
}
