// =============================================================================
// Admin authentication — one bearer credential, checked in constant time
// =============================================================================
//
// A single operator token (`MERIDIAN_ADMIN_TOKEN`) guards the non-public
// surface. REST handlers take the `AuthBearer` extractor; the WebSocket
// upgrade, where the credential arrives as a query parameter instead of a
// header, calls `validate_token`. Both funnel through `check_token`, so every
// path gets the same constant-time comparison and the same failure taxonomy.
//
// The expected token is re-read from the environment per request: rotation
// does not require a restart.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

// ── Core check ───────────────────────────────────────────────────────────────

/// Why a presented credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFailure {
    /// `MERIDIAN_ADMIN_TOKEN` is unset or empty — everything is refused.
    NotConfigured,
    /// No credential on the request.
    Missing,
    /// Credential present but wrong.
    Mismatch,
}

impl AuthFailure {
    fn message(self) -> &'static str {
        match self {
            Self::NotConfigured => "Server authentication not configured",
            Self::Missing => "Missing or invalid authorization token",
            Self::Mismatch => "Invalid authorization token",
        }
    }
}

/// Validate `presented` against the configured admin token.
fn check_token(presented: Option<&str>) -> Result<(), AuthFailure> {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        return Err(AuthFailure::NotConfigured);
    }
    let Some(presented) = presented else {
        return Err(AuthFailure::Missing);
    };
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthFailure::Mismatch)
    }
}

/// Byte-wise comparison that examines every byte even after a mismatch.
/// Length is allowed to leak; the attacker does not control the expected
/// token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Axum extractor ───────────────────────────────────────────────────────────

/// Extractor for `Authorization: Bearer <token>`. On success it yields the
/// presented token (for audit logging); on failure the request is
/// short-circuited with a 403 before the handler body runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection(AuthFailure);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0.message() });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match check_token(presented) {
            Ok(()) => Ok(AuthBearer(presented.unwrap_or_default().to_string())),
            Err(failure) => {
                warn!(failure = ?failure, "admin request refused");
                Err(AuthRejection(failure))
            }
        }
    }
}

// ── Query-parameter path (WebSocket upgrade) ────────────────────────────────

/// Validate a token carried outside the `Authorization` header.
pub fn validate_token(token: &str) -> bool {
    check_token(Some(token)).is_ok()
}

// =============================================================================
// Tests
// =============================================================================
