//! SFTP server module
//!
//! Provides an embedded SFTP server for file management using russh.

mod auth;
mod handler;
mod server;

pub use auth::{SftpAuthenticator, SftpUser};
pub use handler::SftpFileHandler;
pub use server::{SftpConfig, SftpServer};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{AuthConfiguration, ListenConfiguration};
use crate::server::Manager;

/// SFTP errors
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type SftpResult<T> = Result<T, SftpError>;

/// Start the SFTP server bound to `listen.sftp`, authenticating against the
/// OAuth2 collaborator named by `auth.*`.
pub async fn start_server(listen: &ListenConfiguration, auth: &AuthConfiguration, manager: Arc<Manager>) -> SftpResult<()> {
    let bind: SocketAddr = listen
        .sftp
        .parse()
        .map_err(|e| SftpError::Other(format!("invalid listen.sftp address '{}': {}", listen.sftp, e)))?;

    let authenticator = Arc::new(SftpAuthenticator::new(auth.clone(), manager.clone()));
    let sftp_config = SftpConfig {
        bind_address: bind.ip().to_string(),
        bind_port: bind.port(),
        read_only: false,
        host_key_path: PathBuf::from(&listen.sftp_key),
    };

    let server = SftpServer::new(sftp_config, manager, authenticator)?;
    server.run().await
}
