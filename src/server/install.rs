//! Operation pipeline: the install/uninstall/pre/post step executor
//!
//! A `Step` (tagged `{type, args}`) is resolved to a concrete `Operation`
//! via `build_operation` at pipeline-assembly time; an unknown type fails
//! fast with `MissingFactory` rather than at run time.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info};

use crate::filesystem::SafePath;
use crate::server::configuration::{substitute, Step};

/// Errors raised while assembling or running an operation pipeline.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no operation factory registered for step type '{0}'")]
    MissingFactory(String),

    #[error("missing required argument '{0}' for step type '{1}'")]
    MissingArgument(String, String),

    #[error("illegal file access: {0}")]
    IllegalFileAccess(String),

    #[error("command exited with status {0}")]
    CommandFailed(i32),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("digest mismatch after redownload for {0}")]
    DigestMismatch(String),

    #[error("{0}")]
    Other(String),
}

pub type InstallResult<T> = Result<T, InstallError>;

/// A single line of operation output, routed to whatever the caller wants
/// (the owning Program's environment console, a test probe, ...).
pub type TeeFn = std::sync::Arc<dyn Fn(String) + Send + Sync>;

/// Shared context threaded through every operation in a pipeline.
pub struct OperationContext {
    pub root_directory: PathBuf,
    pub cache_directory: PathBuf,
    pub template_vars: HashMap<String, String>,
    pub console: TeeFn,
    pub http: reqwest::Client,
}

impl OperationContext {
    /// Resolve `path` (already template-substituted) as a descendant of
    /// `root_directory`; fails with `IllegalFileAccess` on escape (4.H).
    pub fn resolve(&self, path: &str) -> InstallResult<SafePath> {
        SafePath::new(&self.root_directory, path)
            .map_err(|e| InstallError::IllegalFileAccess(e.to_string()))
    }

    fn sub(&self, template: &str) -> String {
        substitute(template, &self.template_vars)
    }

    fn tee(&self, line: impl Into<String>) {
        (self.console)(line.into());
    }
}

#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()>;
}

/// Resolve a `Step` to a concrete `Operation`. Returns `MissingFactory` for
/// any unrecognised `step.kind`.
pub fn build_operation(step: &Step) -> InstallResult<Box<dyn Operation>> {
    match step.kind.as_str() {
        "command" => Ok(Box::new(CommandOp::from_args(&step.args)?)),
        "download" => Ok(Box::new(DownloadOp::from_args(&step.args)?)),
        "mavenDownload" => Ok(Box::new(MavenDownloadOp::from_args(&step.args)?)),
        "mkdir" => Ok(Box::new(MkdirOp::from_args(&step.args)?)),
        "move" => Ok(Box::new(MoveOp::from_args(&step.args)?)),
        "forgedl" => Ok(Box::new(ForgeDlOp::from_args(&step.args)?)),
        "mojangdl" => Ok(Box::new(MojangDlOp::from_args(&step.args)?)),
        "spongeforgedl" => Ok(Box::new(SpongeForgeDlOp::from_args(&step.args)?)),
        other => Err(InstallError::MissingFactory(other.to_string())),
    }
}

/// Assemble a full pipeline from an ordered list of steps, failing at
/// assembly time (not mid-run) if any step type is unknown.
pub fn build_pipeline(steps: &[Step]) -> InstallResult<Vec<Box<dyn Operation>>> {
    steps.iter().map(build_operation).collect()
}

/// Run every operation in order; abort at the first error (4.D/4.F).
pub async fn run_pipeline(ops: &[Box<dyn Operation>], ctx: &OperationContext) -> InstallResult<()> {
    for op in ops {
        op.run(ctx).await?;
    }
    Ok(())
}

fn required_str(args: &HashMap<String, Value>, key: &str, kind: &str) -> InstallResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| InstallError::MissingArgument(key.to_string(), kind.to_string()))
}

fn required_str_vec(args: &HashMap<String, Value>, key: &str, kind: &str) -> InstallResult<Vec<String>> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .ok_or_else(|| InstallError::MissingArgument(key.to_string(), kind.to_string()))
}

// ============================================================================
// command
// ============================================================================

pub struct CommandOp {
    commands: Vec<String>,
}

impl CommandOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            commands: required_str_vec(args, "commands", "command")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for CommandOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        for raw in &self.commands {
            let command = ctx.sub(raw);
            ctx.tee(format!("$ {command}"));
            debug!("Running install command: {}", command);

            let mut child = tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&ctx.root_directory)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let console = ctx.console.clone();
            let console2 = ctx.console.clone();

            let out_task = stdout.map(|s| {
                tokio::spawn(async move {
                    use tokio::io::AsyncBufReadExt;
                    let mut lines = tokio::io::BufReader::new(s).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        console(line);
                    }
                })
            });
            let err_task = stderr.map(|s| {
                tokio::spawn(async move {
                    use tokio::io::AsyncBufReadExt;
                    let mut lines = tokio::io::BufReader::new(s).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        console2(line);
                    }
                })
            });

            let status = child.wait().await?;
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }

            if !status.success() {
                return Err(InstallError::CommandFailed(status.code().unwrap_or(-1)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// download
// ============================================================================

pub struct DownloadOp {
    files: Vec<String>,
}

impl DownloadOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            files: required_str_vec(args, "files", "download")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for DownloadOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        for raw_url in &self.files {
            let url = ctx.sub(raw_url);
            let basename = url.rsplit('/').next().unwrap_or("download").to_string();
            ctx.tee(format!("Downloading {url} -> {basename}"));
            download_to(&ctx.http, &url, &ctx.resolve(&basename)?.resolved().to_path_buf()).await?;
        }
        Ok(())
    }
}

async fn download_to(client: &reqwest::Client, url: &str, dest: &std::path::Path) -> InstallResult<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

// ============================================================================
// mavenDownload (cached, digest-checked)
// ============================================================================

pub struct MavenDownloadOp {
    url: String,
}

impl MavenDownloadOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            url: required_str(args, "url", "mavenDownload")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for MavenDownloadOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let url = ctx.sub(&self.url);
        let basename = url.rsplit('/').next().unwrap_or("artifact").to_string();
        let cache_path = ctx.cache_directory.join(&basename);
        maven_download_cached(&ctx.http, &url, &cache_path).await?;

        tokio::fs::create_dir_all(&ctx.root_directory).await?;
        let target = ctx.resolve(&basename)?;
        tokio::fs::copy(&cache_path, target.resolved()).await?;
        ctx.tee(format!("Resolved {basename} from cache"));
        Ok(())
    }
}

/// Fetches `<url>.sha1`, compares against a cached copy's digest; only
/// redownloads on mismatch, then verifies the fresh copy (4.E).
async fn maven_download_cached(
    client: &reqwest::Client,
    url: &str,
    cache_path: &std::path::Path,
) -> InstallResult<()> {
    let digest_url = format!("{url}.sha1");
    let expected = client
        .get(&digest_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();

    if cache_path.exists() {
        if let Ok(existing) = tokio::fs::read(cache_path).await {
            if sha1_hex(&existing) == expected {
                debug!("Maven cache hit for {}", url);
                return Ok(());
            }
        }
    }

    info!("Maven cache miss for {}, downloading", url);
    if let Some(parent) = cache_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = client.get(url).send().await?.error_for_status()?.bytes().await?;
    if sha1_hex(&bytes) != expected {
        return Err(InstallError::DigestMismatch(url.to_string()));
    }

    let tmp_path = cache_path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, cache_path).await?;
    Ok(())
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// mkdir
// ============================================================================

pub struct MkdirOp {
    target: String,
}

impl MkdirOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            target: required_str(args, "target", "mkdir")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for MkdirOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let target = ctx.sub(&self.target);
        let safe = ctx.resolve(&target)?;
        tokio::fs::create_dir_all(safe.resolved()).await?;
        Ok(())
    }
}

// ============================================================================
// move
// ============================================================================

pub struct MoveOp {
    source: String,
    target: String,
}

impl MoveOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            source: required_str(args, "source", "move")?,
            target: required_str(args, "target", "move")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for MoveOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let source = ctx.resolve(&ctx.sub(&self.source))?;
        let target = ctx.resolve(&ctx.sub(&self.target))?;
        tokio::fs::rename(source.resolved(), target.resolved()).await?;
        Ok(())
    }
}

// ============================================================================
// forgedl
// ============================================================================

const FORGE_INSTALLER_TEMPLATE: &str =
    "https://maven.minecraftforge.net/net/minecraftforge/forge/{version}/forge-{version}-installer.jar";

pub struct ForgeDlOp {
    version: String,
    target: String,
}

impl ForgeDlOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            version: required_str(args, "version", "forgedl")?,
            target: required_str(args, "target", "forgedl")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for ForgeDlOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let version = ctx.sub(&self.version);
        let url = FORGE_INSTALLER_TEMPLATE.replace("{version}", &version);
        let basename = url.rsplit('/').next().unwrap_or("forge-installer.jar").to_string();
        let cache_path = ctx.cache_directory.join(&basename);
        maven_download_cached(&ctx.http, &url, &cache_path).await?;

        let target = ctx.resolve(&ctx.sub(&self.target))?;
        tokio::fs::copy(&cache_path, target.resolved()).await?;
        ctx.tee(format!("Fetched Forge {version}"));
        Ok(())
    }
}

// ============================================================================
// mojangdl
// ============================================================================

const MOJANG_VERSION_MANIFEST: &str =
    "https://launchermeta.mojang.com/mc/game/version_manifest_v2.json";

pub struct MojangDlOp {
    version: String,
    target: String,
}

impl MojangDlOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        Ok(Self {
            version: required_str(args, "version", "mojangdl")?,
            target: required_str(args, "target", "mojangdl")?,
        })
    }
}

#[async_trait::async_trait]
impl Operation for MojangDlOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let version = ctx.sub(&self.version);
        let manifest: Value = ctx.http.get(MOJANG_VERSION_MANIFEST).send().await?.error_for_status()?.json().await?;

        let version_url = manifest["versions"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|v| v["id"].as_str() == Some(version.as_str()))
            .and_then(|v| v["url"].as_str())
            .ok_or_else(|| InstallError::Other(format!("unknown Minecraft version {version}")))?;

        let version_info: Value = ctx.http.get(version_url).send().await?.error_for_status()?.json().await?;
        let server_jar_url = version_info["downloads"]["server"]["url"]
            .as_str()
            .ok_or_else(|| InstallError::Other(format!("no server jar for version {version}")))?;

        let target = ctx.resolve(&ctx.sub(&self.target))?;
        download_to(&ctx.http, server_jar_url, target.resolved()).await?;
        ctx.tee(format!("Fetched Minecraft server {version}"));
        Ok(())
    }
}

// ============================================================================
// spongeforgedl
// ============================================================================

pub struct SpongeForgeDlOp {
    release_type: String,
}

impl SpongeForgeDlOp {
    fn from_args(args: &HashMap<String, Value>) -> InstallResult<Self> {
        let release_type = args
            .get("releaseType")
            .and_then(Value::as_str)
            .unwrap_or("recommended")
            .to_string();
        Ok(Self { release_type })
    }
}

#[async_trait::async_trait]
impl Operation for SpongeForgeDlOp {
    async fn run(&self, ctx: &OperationContext) -> InstallResult<()> {
        let downloads_url = format!(
            "https://dl-api.spongepowered.org/v2/groups/spongeforge/artifacts/spongeforge/versions?tags=forge&limit=1&{}=true",
            self.release_type
        );
        let body: Value = ctx.http.get(&downloads_url).send().await?.error_for_status()?.json().await?;
        let version = body["artifacts"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|a| a["forge"].as_str())
            .ok_or_else(|| InstallError::Other("no SpongeForge release found".to_string()))?
            .to_string();

        let forge = ForgeDlOp {
            version,
            target: "server.jar".to_string(),
        };
        forge.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_factory_for_unknown_step() {
        let step = Step {
            kind: "not-a-real-step".to_string(),
            args: HashMap::new(),
        };
        let err = build_operation(&step).unwrap_err();
        assert!(matches!(err, InstallError::MissingFactory(_)));
    }

    #[test]
    fn command_requires_commands_arg() {
        let step = Step {
            kind: "command".to_string(),
            args: HashMap::new(),
        };
        let err = build_operation(&step).unwrap_err();
        assert!(matches!(err, InstallError::MissingArgument(_, _)));
    }

    #[tokio::test]
    async fn command_op_runs_and_aborts_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = OperationContext {
            root_directory: dir.path().to_path_buf(),
            cache_directory: dir.path().join("cache"),
            template_vars: HashMap::new(),
            console: std::sync::Arc::new(|_line: String| {}),
            http: reqwest::Client::new(),
        };

        let mut args = HashMap::new();
        args.insert("commands".to_string(), serde_json::json!(["exit 1"]));
        let op = CommandOp::from_args(&args).unwrap();
        let err = op.run(&ctx).await.unwrap_err();
        assert!(matches!(err, InstallError::CommandFailed(1)));
    }

    #[tokio::test]
    async fn mkdir_creates_directory_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = OperationContext {
            root_directory: dir.path().to_path_buf(),
            cache_directory: dir.path().join("cache"),
            template_vars: HashMap::new(),
            console: std::sync::Arc::new(|_line: String| {}),
            http: reqwest::Client::new(),
        };

        let mut args = HashMap::new();
        args.insert("target".to_string(), serde_json::json!("data/world"));
        let op = MkdirOp::from_args(&args).unwrap();
        op.run(&ctx).await.unwrap();
        assert!(dir.path().join("data/world").is_dir());
    }
}
