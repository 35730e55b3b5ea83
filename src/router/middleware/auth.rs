//! Authentication middleware
//!
//! Validates the `Authorization: Bearer <jwt>` header against
//! `auth.publicKey` and stashes the resulting `Claims` in request
//! extensions for handlers to check scopes against. WebSocket upgrades
//! carry the token as a `?token=` query parameter instead, since browsers
//! cannot set arbitrary headers on the upgrade request.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::{self, Claims};

use super::super::AppState;

pub async fn require_auth(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let token = bearer_token(&request).or_else(|| query_token(&request));

    let token = match token {
        Some(t) => t,
        None => return unauthorized("missing or invalid authorization header"),
    };

    match auth::validate_token(&token, &state.config.auth.public_key) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => unauthorized(&e.to_string()),
    }
}

fn bearer_token(request: &Request<Body>) -> Option<String> {
    let header = request.headers().get("Authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|s| s.to_string())
}

fn query_token(request: &Request<Body>) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized", "message": message })),
    )
        .into_response()
}

/// Return 403 if `claims` lacks `scope`; used by handlers after extraction.
pub fn require_scope(claims: &Claims, scope: &str) -> Result<(), Response> {
    if claims.has_scope(scope) {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Forbidden", "message": format!("missing scope {scope}") })),
        )
            .into_response())
    }
}
