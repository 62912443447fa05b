//! Static bearer-token authentication.
//!
//! The agent is protected by a single shared token. A token may be
//! presented as `Authorization: Bearer <token>` or, for WebSocket clients
//! that cannot set headers, as a `token` query parameter. An empty
//! configured token disables authentication.

mod error;
mod middleware;

pub use error::{AuthError, AuthErrorResponse};
pub use middleware::require_token;

/// The configured shared secret.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    token: String,
}

impl AuthState {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty()
    }

    /// Check a presented token. Always succeeds when auth is disabled.
    pub fn validate(&self, presented: &str) -> Result<(), AuthError> {
        if !self.is_enabled() || constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }

    /// Validate whichever credential a request carries, header first.
    pub fn authorize(
        &self,
        authorization: Option<&str>,
        query: Option<&str>,
    ) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if let Some(header) = authorization {
            return self.validate(bearer_token_from_header(header)?);
        }
        match query.and_then(token_from_query) {
            Some(token) => self.validate(&token),
            None => Err(AuthError::MissingAuthHeader),
        }
    }
}

/// Compare two byte strings without an early exit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract a Bearer token from an Authorization header value.
pub fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

/// Find and URL-decode the `token` query parameter.
pub fn token_from_query(query: &str) -> Option<String> {
    query_param(query, "token")
}

/// Find and URL-decode a query parameter.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next()?;
        if key == name {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}
