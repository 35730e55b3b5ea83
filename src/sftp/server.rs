//! SSH/SFTP server implementation using russh
//!
//! Accepts SSH connections, authenticates against the OAuth2 collaborator,
//! and binds each authenticated channel's SFTP subsystem to the addressed
//! program's filesystem root — the chroot policy this daemon enforces.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::{KeyPair, SignatureHash};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::filesystem::Filesystem;
use crate::server::Manager;

use super::auth::{SftpAuthenticator, SftpUser};
use super::handler::SftpFileHandler;
use super::{SftpError, SftpResult};

/// SFTP server configuration
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub read_only: bool,
    pub host_key_path: PathBuf,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5657,
            read_only: false,
            host_key_path: PathBuf::from(".stellar/sftp_host_key"),
        }
    }
}

/// SSH/SFTP server
pub struct SftpServer {
    config: SftpConfig,
    manager: Arc<Manager>,
    authenticator: Arc<SftpAuthenticator>,
}

impl SftpServer {
    pub fn new(
        config: SftpConfig,
        manager: Arc<Manager>,
        authenticator: Arc<SftpAuthenticator>,
    ) -> SftpResult<Self> {
        Ok(Self {
            config,
            manager,
            authenticator,
        })
    }

    /// Load the persisted host key, or generate and persist an RSA-2048 one.
    fn load_or_generate_key(&self) -> SftpResult<KeyPair> {
        let key_path = &self.config.host_key_path;

        if key_path.exists() {
            info!("Loading SSH host key from {}", key_path.display());
            match russh_keys::load_secret_key(key_path, None) {
                Ok(key) => return Ok(key),
                Err(e) => {
                    warn!("failed to load existing host key: {}, generating new one", e);
                }
            }
        }

        info!("Generating new RSA-2048 SSH host key at {}", key_path.display());
        let key = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
            .ok_or_else(|| SftpError::Ssh("RSA key generation failed".into()))?;

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).map_err(SftpError::Io)?;
        }

        let mut key_file = std::fs::File::create(key_path).map_err(SftpError::Io)?;
        russh_keys::encode_pkcs8_pem(&key, &mut key_file)
            .map_err(|e| SftpError::Ssh(format!("failed to encode host key: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(SftpError::Io)?;
        }

        info!("SSH host key generated successfully");
        Ok(key)
    }

    pub async fn run(self) -> SftpResult<()> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let key = self.load_or_generate_key()?;

        let config = russh::server::Config {
            keys: vec![key],
            methods: russh::MethodSet::PASSWORD,
            auth_rejection_time: std::time::Duration::from_secs(3),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            ..Default::default()
        };
        let config = Arc::new(config);

        let listener = TcpListener::bind(&bind_addr).await.map_err(SftpError::Io)?;
        info!("SFTP server listening on {}", bind_addr);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("new SSH connection from {}", peer_addr);

                    let config = config.clone();
                    let authenticator = self.authenticator.clone();
                    let manager = self.manager.clone();
                    let read_only = self.config.read_only;

                    tokio::spawn(async move {
                        let handler = SshHandler::new(authenticator, manager, read_only, peer_addr.to_string());
                        if let Err(e) = russh::server::run_stream(config, socket, handler).await {
                            debug!("SSH connection from {} ended: {:?}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept SSH connection: {}", e);
                }
            }
        }
    }
}

/// SSH connection handler, one per TCP connection.
pub struct SshHandler {
    authenticator: Arc<SftpAuthenticator>,
    manager: Arc<Manager>,
    read_only: bool,
    user: Arc<RwLock<Option<SftpUser>>>,
    sftp_handlers: Arc<Mutex<HashMap<ChannelId, SftpSession>>>,
    peer_addr: String,
}

struct SftpSession {
    handler: Arc<SftpFileHandler>,
}

impl SshHandler {
    fn new(authenticator: Arc<SftpAuthenticator>, manager: Arc<Manager>, read_only: bool, peer_addr: String) -> Self {
        Self {
            authenticator,
            manager,
            read_only,
            user: Arc::new(RwLock::new(None)),
            sftp_handlers: Arc::new(Mutex::new(HashMap::new())),
            peer_addr,
        }
    }
}

impl Clone for SshHandler {
    fn clone(&self) -> Self {
        Self {
            authenticator: self.authenticator.clone(),
            manager: self.manager.clone(),
            read_only: self.read_only,
            user: self.user.clone(),
            sftp_handlers: self.sftp_handlers.clone(),
            peer_addr: self.peer_addr.clone(),
        }
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!("password auth attempt from {} for user {}", self.peer_addr, user);

        match self.authenticator.authenticate(user, password).await {
            Ok(sftp_user) => {
                info!(
                    "SFTP auth successful for {} from {} (server: {})",
                    user, self.peer_addr, sftp_user.server_uuid
                );
                *self.user.write() = Some(sftp_user);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("SFTP auth failed for {} from {}: {}", user, self.peer_addr, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(russh::MethodSet::PASSWORD),
        })
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!("channel open session request on channel {}", channel.id());
        Ok(true)
    }

    async fn subsystem_request(&mut self, channel_id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        debug!("subsystem request: {} on channel {}", name, channel_id);

        if name != "sftp" {
            warn!("unknown subsystem requested: {}", name);
            session.channel_failure(channel_id);
            return Ok(());
        }

        let user = self.user.read().clone();
        let Some(user) = user else {
            warn!("SFTP subsystem requested without authentication");
            session.channel_failure(channel_id);
            return Ok(());
        };

        let program = match self.manager.get(&user.server_uuid) {
            Some(p) => p,
            None => {
                warn!("server {} not found for SFTP session", user.server_uuid);
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        let filesystem = match Filesystem::new(
            program.root_directory().to_path_buf(),
            program.definition().disk_bytes(),
            Vec::new(),
        ) {
            Ok(fs) => Arc::new(fs),
            Err(e) => {
                error!("failed to create filesystem for server {}: {}", user.server_uuid, e);
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        let handler = Arc::new(SftpFileHandler::new(filesystem, user.clone(), self.read_only));
        self.sftp_handlers
            .lock()
            .await
            .insert(channel_id, SftpSession { handler });

        info!("SFTP session started for user {} on server {}", user.user_uuid, user.server_uuid);
        session.channel_success(channel_id);
        Ok(())
    }

    async fn data(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let handlers = self.sftp_handlers.lock().await;

        if let Some(sftp_session) = handlers.get(&channel_id) {
            match sftp_session.handler.process_packet(data).await {
                Ok(response) => {
                    if !response.is_empty() {
                        session.data(channel_id, CryptoVec::from(response));
                    }
                }
                Err(e) => {
                    error!("SFTP packet processing error: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        debug!("channel {} closed", channel_id);
        self.sftp_handlers.lock().await.remove(&channel_id);
        Ok(())
    }

    async fn channel_eof(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        debug!("channel {} EOF", channel_id);
        session.eof(channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sftp_config_default() {
        let config = SftpConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.bind_port, 5657);
        assert!(!config.read_only);
    }
}
