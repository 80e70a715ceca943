//! Request authentication middleware
//!
//! - Admin routes need a session token: `Authorization: Bearer <token>` or the
//!   bare token. The resolved user id is put in request extensions as
//!   [`CurrentUser`].
//! - Public routes need `Authorization: API <token>` matching one of the
//!   configured tokens. With no tokens configured they are open.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::http::AppState;

/// The authenticated admin user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = {
        let header = authorization(req.headers())
            .ok_or_else(|| ApiError::unauthorized("missing session token"))?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        state.sessions.validate(token)?
    };

    req.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(req).await)
}

pub async fn require_api_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let accepted = &state.config.public_api.tokens;
    if !accepted.is_empty() {
        let token = authorization(req.headers())
            .and_then(|v| v.strip_prefix("API "))
            .map(str::trim)
            .ok_or_else(|| ApiError::unauthorized("missing API token"))?;
        if !accepted.iter().any(|t| t == token) {
            return Err(ApiError::unauthorized("invalid API token"));
        }
    }
    Ok(next.run(req).await)
}
