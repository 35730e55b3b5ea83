//! Configuration structures and loading

use std::path::PathBuf;
use anyhow::{Result, Context};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Console ring buffer settings
    #[serde(default)]
    pub console: ConsoleConfiguration,

    /// Listener addresses and TLS/host-key material
    pub listen: ListenConfiguration,

    /// OAuth2 collaborator endpoint and keys
    pub auth: AuthConfiguration,

    /// On-disk roots and operational limits
    #[serde(default)]
    pub data: DataConfiguration,

    /// Docker configuration (only consulted by the docker environment kind)
    #[serde(default)]
    pub docker: DockerConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration = toml::from_str(&content)
            .with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths based on the config file's parent directory
        // or current working directory if config file has no parent
        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.data.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.data.servers)?;
        std::fs::create_dir_all(&config.data.templates)?;
        std::fs::create_dir_all(&config.data.cache)?;
        std::fs::create_dir_all(&config.data.modules)?;
        std::fs::create_dir_all(&config.data.logs)?;

        Ok(config)
    }
}

/// `console.*`
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfiguration {
    /// Ring buffer capacity per program (default 50)
    #[serde(default = "default_console_buffer")]
    pub buffer: usize,
}

fn default_console_buffer() -> usize {
    crate::environment::console::DEFAULT_CAPACITY
}

impl Default for ConsoleConfiguration {
    fn default() -> Self {
        Self {
            buffer: default_console_buffer(),
        }
    }
}

/// `listen.*`
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfiguration {
    /// HTTP(S) listener address, e.g. `0.0.0.0:8080`
    pub web: String,

    #[serde(default)]
    pub web_cert: String,

    #[serde(default)]
    pub web_key: String,

    /// Optional local (unix domain) socket listener path
    #[serde(default)]
    pub socket: Option<String>,

    /// SFTP listener address, default port 5657
    #[serde(default = "default_sftp_listen")]
    pub sftp: String,

    #[serde(default = "default_sftp_key")]
    pub sftp_key: String,
}

fn default_sftp_listen() -> String {
    "0.0.0.0:5657".into()
}

fn default_sftp_key() -> String {
    ".stellar/sftp_host_key".into()
}

/// `auth.*` — OAuth2 collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfiguration {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,

    /// PEM-encoded public key used to validate bearer tokens locally
    #[serde(default)]
    pub public_key: String,
}

/// `data.*`
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfiguration {
    #[serde(default = "default_servers_dir")]
    pub servers: PathBuf,

    #[serde(default = "default_templates_dir")]
    pub templates: PathBuf,

    #[serde(default = "default_cache_dir")]
    pub cache: PathBuf,

    #[serde(default = "default_modules_dir")]
    pub modules: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs: PathBuf,

    /// CrashLimit: auto-restart-on-crash ceiling (default 3)
    #[serde(default = "default_crash_limit")]
    pub crash_limit: u32,

    /// Inline-in-websocket-frame threshold for `file get`, in bytes (default 20MiB)
    #[serde(default = "default_max_ws_download_size")]
    pub max_ws_download_size: u64,
}

impl Default for DataConfiguration {
    fn default() -> Self {
        Self {
            servers: default_servers_dir(),
            templates: default_templates_dir(),
            cache: default_cache_dir(),
            modules: default_modules_dir(),
            logs: default_logs_dir(),
            crash_limit: default_crash_limit(),
            max_ws_download_size: default_max_ws_download_size(),
        }
    }
}

impl DataConfiguration {
    /// Resolve all relative paths to absolute paths based on the given base directory.
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.servers = Self::resolve_path(&self.servers, base_dir);
        self.templates = Self::resolve_path(&self.templates, base_dir);
        self.cache = Self::resolve_path(&self.cache, base_dir);
        self.modules = Self::resolve_path(&self.modules, base_dir);
        self.logs = Self::resolve_path(&self.logs, base_dir);
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_servers_dir() -> PathBuf {
    PathBuf::from(".stellar/servers")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from(".stellar/templates")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".stellar/cache")
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from(".stellar/modules")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from(".stellar/logs")
}

fn default_crash_limit() -> u32 {
    crate::server::crash::DEFAULT_CRASH_LIMIT
}

fn default_max_ws_download_size() -> u64 {
    20 * 1024 * 1024
}

/// Docker configuration; consulted only when a program's `type == "docker"`.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    #[serde(default)]
    pub network: NetworkConfiguration,

    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: u64,

    #[serde(default = "default_container_pid_limit")]
    pub container_pid_limit: i64,

    #[serde(default)]
    pub dns: Vec<String>,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            network: NetworkConfiguration::default(),
            tmpfs_size: default_tmpfs_size(),
            container_pid_limit: default_container_pid_limit(),
            dns: Vec::new(),
        }
    }
}

fn default_docker_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let user_socket = std::path::Path::new(&home).join(".colima/default/docker.sock");
            if user_socket.exists() {
                return format!("unix://{}", user_socket.display());
            }
            let docker_desktop = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if docker_desktop.exists() {
                return format!("unix://{}", docker_desktop.display());
            }
        }
        "/var/run/docker.sock".into()
    }
}

fn default_tmpfs_size() -> u64 {
    100
}

fn default_container_pid_limit() -> i64 {
    512
}

/// Docker network configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfiguration {
    #[serde(default = "default_network_name")]
    pub name: String,

    #[serde(default = "default_network_driver")]
    pub driver: String,

    #[serde(default)]
    pub is_internal: bool,
}

fn default_network_name() -> String {
    "stellar".into()
}

fn default_network_driver() -> String {
    "bridge".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_buffer_default_matches_spec() {
        assert_eq!(ConsoleConfiguration::default().buffer, 50);
    }

    #[test]
    fn crash_limit_default_is_three() {
        assert_eq!(DataConfiguration::default().crash_limit, 3);
    }

    #[test]
    fn sftp_default_port_is_5657() {
        assert_eq!(default_sftp_listen(), "0.0.0.0:5657");
    }
}
