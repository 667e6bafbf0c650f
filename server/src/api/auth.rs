//! Auth middleware: resolves `tenant_id`/`user_id`/`is_admin`/`is_moderator`
//! from a bearer JWT (spec §4.6(ii)). The login/2FA/password mechanics that
//! *produce* this token are out of scope (spec §1); this extractor is the
//! documented boundary the external auth front-end must satisfy.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use goconnect_shared::{
    domain::{TenantId, UserId},
    error::GoConnectError,
};
use jsonwebtoken::{DecodingKey, Validation};

use crate::{AppState, Claims};

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub is_admin: bool,
    pub is_moderator: bool,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = GoConnectError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GoConnectError::Unauthorized)?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(GoConnectError::InvalidToken)?;

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => GoConnectError::TokenExpired,
            _ => GoConnectError::InvalidToken,
        })?;

        Ok(AuthContext {
            user_id: UserId(data.claims.sub),
            tenant_id: data.claims.tenant_id,
            is_admin: data.claims.is_admin,
            is_moderator: data.claims.is_moderator,
        })
    }
}

/// `Accept: application/json` is required for data endpoints (spec §4.6(i));
/// anything else is rejected with a stable `400 "Only JSON API"` message
/// rather than an ad hoc parse failure.
pub fn require_json_accept(headers: &axum::http::HeaderMap) -> Result<(), GoConnectError> {
    let ok = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json") || v.contains("*/*"))
        .unwrap_or(true);
    if ok {
        Ok(())
    } else {
        Err(GoConnectError::validation("Only JSON API"))
    }
}

/// Mutations must carry `Idempotency-Key` (spec §4.6(iii)).
pub fn require_idempotency_key(headers: &axum::http::HeaderMap) -> Result<String, GoConnectError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| GoConnectError::validation("Idempotency-Key header is required"))
}
