//! Program: the state machine that composes install/run/stop/post steps
//! over a process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DockerConfiguration;
use crate::environment::{
    DockerEnvironment, EnvironmentConfiguration, ExitCallback, ProcessEnvironment,
    StandardEnvironment,
};
use crate::events::EventBus;
use crate::filesystem::Filesystem;
use crate::system::Locker;

use super::configuration::{substitute, substitute_all, substitute_map, ProgramDefinition};
use super::crash::CrashCounter;
use super::install::{build_pipeline, run_pipeline, InstallError, OperationContext};
use super::power::{PowerAction, PowerError};
use super::state::ServerState;

/// Sending half of the start queue (see `manager::Manager`).
pub type StartQueueSender = mpsc::UnboundedSender<Arc<Program>>;

/// A managed program: one controlled process composed over an Environment.
pub struct Program {
    definition: RwLock<ProgramDefinition>,
    environment: Arc<dyn ProcessEnvironment>,
    state: ServerState,
    power_lock: Locker,
    crash_counter: CrashCounter,
    filesystem: Filesystem,
    root_directory: PathBuf,
    cache_directory: PathBuf,
    definition_path: PathBuf,
    http: reqwest::Client,
    start_queue: StartQueueSender,
}

impl Program {
    /// Construct a Program from its persisted definition. Creates
    /// `RootDirectory` and builds the Environment matching `definition.kind`.
    pub fn new(
        definition: ProgramDefinition,
        servers_root: &std::path::Path,
        cache_root: &std::path::Path,
        docker_config: &DockerConfiguration,
        crash_limit: u32,
        start_queue: StartQueueSender,
    ) -> Result<Self, ProgramError> {
        let root_directory = servers_root.join(&definition.identifier);
        std::fs::create_dir_all(&root_directory).map_err(ProgramError::Io)?;
        std::fs::create_dir_all(cache_root).map_err(ProgramError::Io)?;

        let definition_path = servers_root.join(format!("{}.json", definition.identifier));
        let environment = build_environment(&definition, &root_directory, docker_config)
            .map_err(|e| ProgramError::Environment(e.to_string()))?;
        let filesystem = Filesystem::new(root_directory.clone(), definition.disk_bytes(), Vec::new())
            .map_err(|e| ProgramError::Other(e.to_string()))?;
        let crash_counter = CrashCounter::with_count(crash_limit, definition.crash_counter);

        Ok(Self {
            definition: RwLock::new(definition),
            environment,
            state: ServerState::new(),
            power_lock: Locker::new(),
            crash_counter,
            filesystem,
            root_directory,
            cache_directory: cache_root.to_path_buf(),
            definition_path,
            http: reqwest::Client::new(),
            start_queue,
        })
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn id(&self) -> String {
        self.definition.read().identifier.clone()
    }

    pub fn definition(&self) -> ProgramDefinition {
        self.definition.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        self.environment.events()
    }

    pub fn environment(&self) -> &Arc<dyn ProcessEnvironment> {
        &self.environment
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }

    pub fn root_directory(&self) -> &std::path::Path {
        &self.root_directory
    }

    pub fn is_installing(&self) -> bool {
        self.state.is_installing()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state.is_marked_for_deletion()
    }

    pub fn is_suspended(&self) -> bool {
        self.definition.read().suspended
    }

    pub async fn read_logs(&self, lines: u32) -> Result<Vec<String>, ProgramError> {
        self.environment
            .read_log(lines)
            .await
            .map_err(|e| ProgramError::Environment(e.to_string()))
    }

    // ========================================================================
    // Power operations (4.F)
    // ========================================================================

    pub async fn handle_power_action(self: &Arc<Self>, action: PowerAction) -> Result<(), PowerError> {
        match action {
            PowerAction::Start => self.start().await,
            PowerAction::Stop => self.stop().await,
            PowerAction::Restart => {
                self.stop().await?;
                self.wait_for_main_process(Some(Duration::from_secs(600))).await?;
                self.start().await
            }
            PowerAction::Kill => self.kill().await,
        }
    }

    /// `Start()`: preconditions `enabled == true` and not currently running.
    /// Returns immediately; does not wait for the child.
    pub async fn start(self: &Arc<Self>) -> Result<(), PowerError> {
        if self.is_marked_for_deletion() {
            return Err(PowerError::Other("server marked for deletion".to_string()));
        }
        if self.is_suspended() {
            return Err(PowerError::Suspended);
        }
        if !self.definition.read().execution.enabled {
            return Err(PowerError::ServerDisabled);
        }
        if self.environment.is_running().await.unwrap_or(false) {
            return Err(PowerError::AlreadyRunning);
        }

        let _guard = self.power_lock.try_acquire().map_err(|_| PowerError::Busy)?;

        // (1) pre pipeline
        let pre_steps = self.definition.read().execution.pre.clone();
        let ctx = self.operation_context(HashMap::new());
        let ops = build_pipeline(&pre_steps).map_err(|e| PowerError::Other(e.to_string()))?;
        if let Err(e) = run_pipeline(&ops, &ctx).await {
            self.environment.display_to_console(&format!("pre step failed: {e}"));
            return Err(PowerError::Other(e.to_string()));
        }

        // (2)/(3) substitute invocation and launch
        let definition = self.definition.read().clone();
        let template_ctx = definition.template_context(&self.root_directory.to_string_lossy());
        let program = substitute(&definition.execution.program, &template_ctx);
        let args = substitute_all(&definition.execution.arguments, &template_ctx);
        let env = substitute_map(&definition.execution.env, &template_ctx);

        let this = Arc::clone(self);
        let on_exit: ExitCallback = Arc::new(move |graceful| {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                this.on_exit(graceful).await;
            });
        });

        info!("starting program {}", self.id());
        self.environment
            .execute_async(&program, args, env, on_exit)
            .await
            .map_err(PowerError::Environment)
    }

    /// `Stop()`: no effect if not running; dispatches and returns.
    pub async fn stop(&self) -> Result<(), PowerError> {
        if !self.environment.is_running().await.unwrap_or(false) {
            return Ok(());
        }
        let _guard = self.power_lock.try_acquire().map_err(|_| PowerError::Busy)?;

        let (stop_code, stop_command) = {
            let def = self.definition.read();
            (def.execution.stop_code, def.execution.stop_command.clone())
        };

        if stop_code != 0 {
            self.environment.send_code(stop_code).await.map_err(PowerError::Environment)
        } else {
            self.environment
                .send_command(&stop_command)
                .await
                .map_err(PowerError::Environment)
        }
    }

    /// `Kill()`: unconditional SIGKILL.
    pub async fn kill(&self) -> Result<(), PowerError> {
        self.environment.kill().await.map_err(PowerError::Environment)
    }

    /// Block until the current child, if any, has reaped.
    pub async fn wait_for_main_process(&self, timeout: Option<Duration>) -> Result<(), PowerError> {
        self.environment
            .wait_for_main_process(CancellationToken::new(), timeout)
            .await
            .map_err(PowerError::Environment)
    }

    /// `Execute(cmd)`: writes one line to the child's stdin.
    pub async fn execute(&self, cmd: &str) -> Result<(), PowerError> {
        self.environment
            .execute_in_main_process(cmd)
            .await
            .map_err(PowerError::Environment)
    }

    /// **onExit callback** — the single resume point after the child reaps.
    async fn on_exit(self: Arc<Self>, graceful: bool) {
        if graceful {
            self.crash_counter.reset();
        }

        let post_steps = self.definition.read().execution.post.clone();
        let mut extra = HashMap::new();
        extra.insert("success".to_string(), graceful.to_string());
        let ctx = self.operation_context(extra);

        match build_pipeline(&post_steps) {
            Ok(ops) => {
                if let Err(e) = run_pipeline(&ops, &ctx).await {
                    error!("post pipeline failed for {}: {}", self.id(), e);
                    self.environment.display_to_console(&format!("post step failed: {e}"));
                }
            }
            Err(e) => {
                error!("post pipeline assembly failed for {}: {}", self.id(), e);
                self.environment.display_to_console(&format!("post step failed: {e}"));
            }
        }

        let (auto_restart_on_graceful, auto_restart_on_crash) = {
            let def = self.definition.read();
            (def.execution.auto_restart_on_graceful, def.execution.auto_restart_on_crash)
        };

        let should_enqueue = if graceful {
            auto_restart_on_graceful
        } else if auto_restart_on_crash {
            let recorded = self.crash_counter.record_crash();
            if !recorded {
                self.environment.display_to_console(&format!(
                    "server has crashed {} times in a row, auto-restart disabled until a graceful exit",
                    self.crash_counter.limit()
                ));
            }
            recorded
        } else {
            false
        };

        if should_enqueue {
            let _ = self.start_queue.send(Arc::clone(&self));
        }
    }

    // ========================================================================
    // Installation (4.F / 4.E)
    // ========================================================================

    /// `Install()`: stops if running, creates RootDirectory, runs the
    /// Installation pipeline.
    pub async fn install(&self) -> Result<(), InstallError> {
        if !self.state.try_start_installing() {
            return Err(InstallError::Other("already installing".to_string()));
        }
        let _guard = scopeguard::guard((), |_| self.state.set_installing(false));

        if self.environment.is_running().await.unwrap_or(false) {
            let ctx = CancellationToken::new();
            let _ = self.environment.stop(ctx.clone()).await;
            let _ = self
                .environment
                .wait_for_stop(ctx, Duration::from_secs(600), true)
                .await;
        }

        tokio::fs::create_dir_all(&self.root_directory).await?;

        let steps = self.definition.read().installation.clone();
        let ops = build_pipeline(&steps)?;
        let ctx = self.operation_context(HashMap::new());
        self.environment.display_to_console("Running installation pipeline");
        run_pipeline(&ops, &ctx).await
    }

    /// `Destroy()`: runs the Uninstallation pipeline then deletes the
    /// environment.
    pub async fn destroy(&self) -> Result<(), InstallError> {
        self.state.mark_for_deletion();

        let steps = self.definition.read().uninstallation.clone();
        let ctx = self.operation_context(HashMap::new());
        let result = match build_pipeline(&steps) {
            Ok(ops) => run_pipeline(&ops, &ctx).await,
            Err(e) => Err(e),
        };

        let _ = self.environment.destroy().await;
        let _ = std::fs::remove_file(&self.definition_path);
        result
    }

    // ========================================================================
    // Configuration (4.F Edit/Save)
    // ========================================================================

    /// `Edit(vars, adminOverride)`: for each provided key, update if
    /// `userEditable` or `adminOverride`; then persist.
    pub fn edit(&self, updates: HashMap<String, Value>, admin_override: bool) -> Result<(), ProgramError> {
        {
            let mut def = self.definition.write();
            for (key, value) in updates {
                if let Some(var) = def.variables.get_mut(&key) {
                    if var.user_editable || admin_override {
                        var.value = value;
                    }
                }
            }
        }
        self.save()
    }

    /// Replace the whole definition (used by `Manager::Reload`), preserving
    /// this Program's Environment and CrashCounter.
    pub fn replace_definition(&self, new_definition: ProgramDefinition) {
        *self.definition.write() = new_definition;
    }

    /// `Save(path)`: serialise to the canonical JSON schema atomically.
    pub fn save(&self) -> Result<(), ProgramError> {
        let mut definition = self.definition.read().clone();
        definition.crash_counter = self.crash_counter.count();

        let tmp_path = self.definition_path.with_extension("json.tmp");
        let file = std::fs::File::create(&tmp_path).map_err(ProgramError::Io)?;
        serde_json::to_writer_pretty(file, &definition).map_err(|e| ProgramError::Other(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.definition_path).map_err(ProgramError::Io)?;
        Ok(())
    }

    fn operation_context(&self, extra: HashMap<String, String>) -> OperationContext {
        let def = self.definition.read();
        let mut template_vars = def.template_context(&self.root_directory.to_string_lossy());
        template_vars.extend(extra);

        let environment = Arc::clone(&self.environment);
        OperationContext {
            root_directory: self.root_directory.clone(),
            cache_directory: self.cache_directory.clone(),
            template_vars,
            console: Arc::new(move |line: String| environment.display_to_console(&line)),
            http: self.http.clone(),
        }
    }
}

/// Build the concrete Environment for a Program from its `kind` selector.
fn build_environment(
    definition: &ProgramDefinition,
    root_directory: &std::path::Path,
    docker_config: &DockerConfiguration,
) -> Result<Arc<dyn ProcessEnvironment>, crate::environment::EnvironmentError> {
    let mut env_config = EnvironmentConfiguration {
        id: definition.identifier.clone(),
        root_directory: root_directory.to_path_buf(),
        env: definition.execution.env.clone(),
        ..Default::default()
    };

    match definition.kind.as_str() {
        "docker" => {
            env_config.image = definition.image.clone();
            env_config.invocation = format!(
                "{} {}",
                definition.execution.program,
                definition.execution.arguments.join(" ")
            );
            env_config.limits = crate::environment::ResourceLimits {
                memory: definition.memory_bytes(),
                memory_swap: definition.swap_bytes(),
                cpu_quota: definition.cpu_quota(),
                cpu_period: 100000,
                cpu_shares: 1024,
                io_weight: definition.limits.io_weight as u16,
                pids_limit: docker_config.container_pid_limit,
                disk_space: definition.disk_bytes(),
            };
            env_config.mounts = vec![crate::environment::MountConfig {
                source: root_directory.to_string_lossy().to_string(),
                target: "/home/container".to_string(),
                read_only: false,
            }];
            env_config.labels.insert("Service".to_string(), "StellarStack".to_string());
            env_config.labels.insert("ProgramId".to_string(), definition.identifier.clone());
            env_config.dns = docker_config.dns.clone();
            env_config.network = docker_config.network.name.clone();
            env_config.tmpfs_size = docker_config.tmpfs_size;
            env_config.oom_disabled = definition.limits.oom_disabled;

            let env = DockerEnvironment::new(env_config)?;
            Ok(Arc::new(env))
        }
        #[cfg(unix)]
        "tty" => Ok(Arc::new(crate::environment::TtyEnvironment::new(env_config))),
        _ => Ok(Arc::new(StandardEnvironment::new(env_config))),
    }
}

/// Program errors not already modeled by `PowerError`/`InstallError`.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::configuration::{Execution, ProgramDefinition, Variables};
    use std::collections::HashMap as Map;

    fn test_definition(id: &str) -> ProgramDefinition {
        ProgramDefinition {
            identifier: id.to_string(),
            display: id.to_string(),
            kind: "standard".to_string(),
            variables: Variables::new(),
            execution: Execution {
                program: "/bin/echo".to_string(),
                arguments: vec!["hi".to_string()],
                env: Map::new(),
                stop_command: "stop".to_string(),
                stop_code: 0,
                enabled: true,
                auto_start: false,
                auto_restart_on_crash: false,
                auto_restart_on_graceful: false,
                pre: Vec::new(),
                post: Vec::new(),
            },
            installation: Vec::new(),
            uninstallation: Vec::new(),
            image: String::new(),
            limits: Default::default(),
            suspended: false,
            crash_counter: 0,
        }
    }

    #[tokio::test]
    async fn disabled_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut definition = test_definition("disabled-prog");
        definition.execution.enabled = false;
        let (tx, _rx) = mpsc::unbounded_channel();
        let program = Arc::new(
            Program::new(definition, dir.path(), &dir.path().join("cache"), &DockerConfiguration::default(), 3, tx)
                .unwrap(),
        );

        let err = program.start().await.unwrap_err();
        assert!(matches!(err, PowerError::ServerDisabled));
    }

    #[tokio::test]
    async fn start_runs_and_reaps_via_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let definition = test_definition("echo-prog");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let program = Arc::new(
            Program::new(definition, dir.path(), &dir.path().join("cache"), &DockerConfiguration::default(), 3, tx)
                .unwrap(),
        );

        program.start().await.unwrap();
        program.wait_for_main_process(Some(Duration::from_secs(5))).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
