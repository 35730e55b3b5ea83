//! SFTP wire-protocol framing
//!
//! Implements only the version handshake and a protocol-correct "operation
//! unsupported" reply for every request past it. The part of the SFTP
//! surface that matters here is chroot policy — which program's
//! [`Filesystem`] a session is bound to — and that binding happens in
//! [`super::server`] before a single byte of this module runs. Real file
//! operations (open/read/write/readdir/...) are not implemented.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::filesystem::Filesystem;
use super::auth::SftpUser;

const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_STATUS: u8 = 101;

const SSH_FX_OP_UNSUPPORTED: u32 = 8;
const PROTOCOL_VERSION: u32 = 3;

/// SFTP file operations handler, scoped to one authenticated channel.
pub struct SftpFileHandler {
    /// Filesystem rooted at the bound program's data directory
    #[allow(dead_code)]
    filesystem: Arc<Filesystem>,

    /// Authenticated user owning this channel
    #[allow(dead_code)]
    user: SftpUser,

    /// Read-only mode
    #[allow(dead_code)]
    read_only: bool,

    /// Bytes carried over from a partial frame
    buffer: Mutex<Vec<u8>>,
}

impl SftpFileHandler {
    pub fn new(filesystem: Arc<Filesystem>, user: SftpUser, read_only: bool) -> Self {
        Self {
            filesystem,
            user,
            read_only,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Feed raw channel bytes in, get serialized SFTP response packets out.
    ///
    /// Frames follow the SFTP wire format: a 4-byte big-endian length
    /// prefix followed by that many bytes of payload. Multiple frames may
    /// be concatenated; a frame may also be split across calls.
    pub async fn process_packet(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            if buffer.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
            if buffer.len() < 4 + len {
                break;
            }

            let frame = buffer[4..4 + len].to_vec();
            buffer.drain(0..4 + len);

            if let Some(reply) = self.handle_frame(&frame) {
                out.extend_from_slice(&reply);
            }
        }

        Ok(out)
    }

    fn handle_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let kind = *frame.first()?;

        match kind {
            SSH_FXP_INIT => {
                debug!("SFTP init from {}", self.user.user_uuid);
                Some(encode_version())
            }
            _ => {
                // Request id follows the type byte for every message but
                // init/version.
                if frame.len() < 5 {
                    return None;
                }
                let request_id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                Some(encode_status(request_id, SSH_FX_OP_UNSUPPORTED, "operation not supported"))
            }
        }
    }
}

fn encode_version() -> Vec<u8> {
    let mut payload = vec![SSH_FXP_VERSION];
    payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame(payload)
}

fn encode_status(request_id: u32, code: u32, message: &str) -> Vec<u8> {
    let mut payload = vec![SSH_FXP_STATUS];
    payload.extend_from_slice(&request_id.to_be_bytes());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&(message.len() as u32).to_be_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // empty language tag
    frame(payload)
}

fn frame(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Filesystem;
    use tempfile::TempDir;

    fn handler() -> (TempDir, SftpFileHandler) {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(Filesystem::new(dir.path().to_path_buf(), u64::MAX, Vec::new()).unwrap());
        let user = SftpUser {
            server_uuid: "srv".into(),
            user_uuid: "acct".into(),
            permissions: vec!["*".into()],
        };
        (dir, SftpFileHandler::new(fs, user, false))
    }

    #[tokio::test]
    async fn init_returns_version() {
        let (_dir, handler) = handler();
        let init = frame(vec![SSH_FXP_INIT, 0, 0, 0, 3]);
        let reply = handler.process_packet(&init).await.unwrap();
        assert_eq!(reply, encode_version());
    }

    #[tokio::test]
    async fn unknown_request_is_unsupported() {
        let (_dir, handler) = handler();
        let open = frame(vec![3, 0, 0, 0, 42]);
        let reply = handler.process_packet(&open).await.unwrap();
        assert_eq!(reply, encode_status(42, SSH_FX_OP_UNSUPPORTED, "operation not supported"));
    }

    #[tokio::test]
    async fn handles_split_frames() {
        let (_dir, handler) = handler();
        let init = frame(vec![SSH_FXP_INIT, 0, 0, 0, 3]);
        let (first, second) = init.split_at(2);
        assert!(handler.process_packet(first).await.unwrap().is_empty());
        let reply = handler.process_packet(second).await.unwrap();
        assert_eq!(reply, encode_version());
    }
}
