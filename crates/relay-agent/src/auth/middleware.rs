//! Authentication middleware.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use log::debug;

use super::{AuthError, AuthState};

/// Reject requests that do not carry the configured token.
///
/// Supports, in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. token query parameter (for WebSocket connections)
pub async fn require_token(
    State(auth): State<AuthState>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if let Err(e) = auth.authorize(header, req.uri().query()) {
        debug!("rejecting {} {}: {}", req.method(), req.uri().path(), e);
        return Err(e);
    }

    Ok(next.run(req).await)
}
