use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use base64::Engine as _;
use lfss_core::types::UserRecord;
use lfss_core::{lifecycle, user};

use crate::state::AppState;

/// `Authorization: Bearer <token>`, HTTP Basic, or `?token=` query,
/// falling back to the guest user — the cascade named in §6: try the
/// header, then a fallback, then give up gracefully rather than
/// hard-failing.
pub struct AuthUser(pub UserRecord);

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let token = extract_token(parts).await;

        let Some(token) = token else {
            return Ok(AuthUser(lifecycle::guest()));
        };

        match user::authenticate(&app_state.engine, &token).await {
            Ok(Some(u)) => {
                app_state.engine.debounce().touch_last_active(u.id);
                Ok(AuthUser(u))
            }
            Ok(None) => Err(StatusCode::UNAUTHORIZED),
            Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

async fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(auth) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        let value = auth.to_str().ok()?;
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return Some(bearer.trim().to_string());
        }
        if let Some(basic) = value.strip_prefix("Basic ") {
            let decoded = base64::engine::general_purpose::STANDARD.decode(basic.trim()).ok()?;
            let text = String::from_utf8(decoded).ok()?;
            let (username, password) = text.split_once(':')?;
            return Some(lfss_core::user::hash_credential(username, password));
        }
    }
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            return Some(percent_encoding::percent_decode_str(value).decode_utf8_lossy().into_owned());
        }
    }
    None
}

pub fn require_authenticated(user: &UserRecord) -> Result<(), StatusCode> {
    if user.is_guest() {
        Err(StatusCode::UNAUTHORIZED)
    } else {
        Ok(())
    }
}
