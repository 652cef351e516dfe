use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// Reject requests whose Host header is not in TRUSTED_HOSTS. A `*` entry
/// disables the check.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(':').next().unwrap_or(value).trim().to_string())
        .unwrap_or_default();

    let allowed = !host.is_empty()
        && trusted
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(&host));

    if allowed {
        next.run(request).await
    } else {
        AppError::BadRequest(format!("Untrusted host '{host}'.")).into_response()
    }
}
