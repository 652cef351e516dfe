use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[allow(dead_code)]
    pub exp: usize,
}

/// Resolve the calling user's id from the request headers.
///
/// Order: the `x-user-id` dev override (never honored in production), then a
/// `Bearer` access token verified against AUTH_JWT_SECRET.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_str(headers, "x-user-id") {
            return Ok(user_id);
        }
    }

    let claims = verify_bearer(state, headers)?;
    let user_id = claims.sub.trim().to_string();
    if user_id.is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token is missing a subject.".to_string(),
        ));
    }
    Ok(user_id)
}

fn verify_bearer(state: &AppState, headers: &HeaderMap) -> AppResult<AccessClaims> {
    let token = header_str(headers, "authorization")
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .map(str::trim)
                .map(ToOwned::to_owned)
        })
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
        })?;

    let secret = state.config.auth_jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("AUTH_JWT_SECRET is not configured.".to_string())
    })?;

    let validation = Validation::new(Algorithm::HS256);
    decode::<AccessClaims>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|error| AppError::Unauthorized(format!("Unauthorized: invalid token ({error}).")))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}
