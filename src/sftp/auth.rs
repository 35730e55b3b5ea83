//! SFTP authentication
//!
//! Username format is `server_id.account`, mirroring the control-plane
//! convention of addressing a program by its identifier. The password is
//! exchanged with the OAuth2 collaborator via a password grant scoped to
//! `sftp`; the daemon itself never stores or validates credentials.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::AuthConfiguration;
use crate::server::Manager;
use super::{SftpError, SftpResult};

/// Authenticated SFTP user
#[derive(Debug, Clone)]
pub struct SftpUser {
    /// Program identifier selecting the exposed filesystem root
    pub server_uuid: String,

    /// Collaborator-assigned account identifier
    pub user_uuid: String,

    /// Granted scopes, reusing the control plane's dotted namespace
    pub permissions: Vec<String>,
}

impl SftpUser {
    /// Check if user has a specific permission
    pub fn has_permission(&self, permission: &str) -> bool {
        if self.permissions.iter().any(|p| p == "*") {
            return true;
        }

        if self.permissions.iter().any(|p| p == permission) {
            return true;
        }

        let parts: Vec<&str> = permission.split('.').collect();
        if parts.len() > 1 {
            let prefix = format!("{}.*", parts[0]);
            if self.permissions.iter().any(|p| *p == prefix) {
                return true;
            }
        }

        false
    }

    pub fn can_read(&self) -> bool {
        self.has_permission(crate::auth::scope::FILES)
    }

    pub fn can_write(&self) -> bool {
        self.has_permission(crate::auth::scope::FILES_PUT)
    }

    pub fn can_delete(&self) -> bool {
        self.has_permission(crate::auth::scope::FILES_DELETE)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    scope: String,
}

/// SFTP authenticator
pub struct SftpAuthenticator {
    http: reqwest::Client,
    auth: AuthConfiguration,
    manager: Arc<Manager>,
}

impl SftpAuthenticator {
    pub fn new(auth: AuthConfiguration, manager: Arc<Manager>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            manager,
        }
    }

    /// Authenticate a user
    ///
    /// Username format: `server_id.account` (split on the FIRST dot so the
    /// account half may itself contain dots, e.g. an email address).
    pub async fn authenticate(&self, username: &str, password: &str) -> SftpResult<SftpUser> {
        debug!("SFTP auth attempt for user: {}", username);

        let parts: Vec<&str> = username.splitn(2, '.').collect();
        if parts.len() != 2 {
            warn!("invalid SFTP username format: {}", username);
            return Err(SftpError::AuthFailed(
                "expected username format server_id.account".into(),
            ));
        }

        let server_uuid = parts[0];
        let user_uuid = parts[1];

        if !self.manager.exists(server_uuid) {
            warn!("SFTP auth failed: server {} not found", server_uuid);
            return Err(SftpError::ServerNotFound(server_uuid.to_string()));
        }

        let response = self
            .http
            .post(format!("{}/oauth/token", self.auth.url.trim_end_matches('/')))
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.auth.client_id.as_str()),
                ("client_secret", self.auth.client_secret.as_str()),
                ("username", username),
                ("password", password),
                ("scope", "sftp"),
            ])
            .send()
            .await
            .map_err(|e| SftpError::AuthFailed(e.to_string()))?;

        if !response.status().is_success() {
            warn!("SFTP auth rejected by collaborator for {}", username);
            return Err(SftpError::AuthFailed("invalid credentials".into()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SftpError::AuthFailed(e.to_string()))?;

        let permissions: Vec<String> = token
            .scope
            .split_whitespace()
            .map(str::to_string)
            .collect();

        info!("SFTP auth successful for user {} on server {}", user_uuid, server_uuid);

        Ok(SftpUser {
            server_uuid: server_uuid.to_string(),
            user_uuid: user_uuid.to_string(),
            permissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_permissions() {
        let user = SftpUser {
            server_uuid: "test".to_string(),
            user_uuid: "user".to_string(),
            permissions: vec![
                crate::auth::scope::FILES.to_string(),
                crate::auth::scope::FILES_PUT.to_string(),
            ],
        };

        assert!(user.has_permission(crate::auth::scope::FILES));
        assert!(user.can_read());
        assert!(user.can_write());
        assert!(!user.can_delete());
    }

    #[test]
    fn test_wildcard_permission() {
        let user = SftpUser {
            server_uuid: "test".to_string(),
            user_uuid: "user".to_string(),
            permissions: vec!["*".to_string()],
        };

        assert!(user.has_permission("anything"));
        assert!(user.can_read());
        assert!(user.can_write());
        assert!(user.can_delete());
    }

    #[test]
    fn test_prefix_permission() {
        let user = SftpUser {
            server_uuid: "test".to_string(),
            user_uuid: "user".to_string(),
            permissions: vec!["servers.files.*".to_string()],
        };

        assert!(user.has_permission(crate::auth::scope::FILES_PUT));
        assert!(user.has_permission(crate::auth::scope::FILES_DELETE));
    }
}
