//! Bearer token validation for the HTTP and WebSocket control planes.
//!
//! Tokens are RS256 JWTs issued by the OAuth2 collaborator named in
//! `auth.url`/`auth.clientId`/`auth.clientSecret`; this daemon only
//! validates them locally against `auth.publicKey`, it never talks to the
//! collaborator itself for request-time checks.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scopes named by the control plane (HTTP and WebSocket share this set).
pub mod scope {
    pub const STAT: &str = "servers.stat";
    pub const START: &str = "servers.start";
    pub const STOP: &str = "servers.stop";
    pub const INSTALL: &str = "servers.install";
    pub const EDIT_ADMIN: &str = "servers.edit.admin";
    pub const CONSOLE_SEND: &str = "servers.console.send";
    pub const FILES: &str = "servers.files";
    pub const FILES_PUT: &str = "servers.files.put";
    pub const FILES_DELETE: &str = "servers.files.delete";
}

/// Claims carried by a validated bearer token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Claims {
    /// Subject (user or service identifier).
    pub sub: String,

    /// Granted scopes, e.g. `["servers.stat", "servers.files"]`.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Expiration timestamp (seconds since epoch).
    pub exp: usize,
}

impl Claims {
    /// Full control: either an exact scope, a wildcard (`*`), or a
    /// namespace prefix (`servers.files.*` covers `servers.files.put`).
    pub fn has_scope(&self, scope: &str) -> bool {
        if self.scopes.iter().any(|s| s == "*") {
            return true;
        }
        if self.scopes.iter().any(|s| s == scope) {
            return true;
        }
        let parts: Vec<&str> = scope.split('.').collect();
        for i in (1..parts.len()).rev() {
            let prefix = format!("{}.*", parts[..i].join("."));
            if self.scopes.iter().any(|s| *s == prefix) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("insufficient scope: {0}")]
    Forbidden(String),
}

/// Validate a bearer token against the configured public key.
pub fn validate_token(token: &str, public_key_pem: &str) -> Result<Claims, AuthError> {
    let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    let validation = Validation::new(Algorithm::RS256);

    let data = decode::<Claims>(token, &key, &validation).map_err(|e| {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        }
    })?;

    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(scopes: &[&str]) -> Claims {
        Claims {
            sub: "test".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            exp: usize::MAX,
        }
    }

    #[test]
    fn wildcard_scope_grants_everything() {
        assert!(claims(&["*"]).has_scope(scope::FILES_DELETE));
    }

    #[test]
    fn exact_scope_matches() {
        assert!(claims(&[scope::STAT]).has_scope(scope::STAT));
        assert!(!claims(&[scope::STAT]).has_scope(scope::START));
    }

    #[test]
    fn namespace_prefix_covers_children() {
        assert!(claims(&["servers.files.*"]).has_scope(scope::FILES_PUT));
        assert!(claims(&["servers.files.*"]).has_scope(scope::FILES_DELETE));
        assert!(!claims(&["servers.files.*"]).has_scope(scope::CONSOLE_SEND));
    }
}
