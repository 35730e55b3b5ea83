//! Pseudo-terminal process environment (POSIX only)
//!
//! Like `StandardEnvironment` but the child is given a controlling PTY
//! instead of anonymous pipes: it becomes the session leader of the slave
//! side, and stdout/stdin share the single master fd. Interactive
//! programs that detect a tty (progress bars, line editors) behave the
//! same way they would run from a shell.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, ProcessState};
use super::console::ConsoleBuffer;
use super::traits::{
    EnvironmentConfiguration, EnvironmentError, EnvironmentResult, ExitCallback, ExitState,
    LogCallback, ProcessEnvironment, StatSample,
};

struct RunningChild {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    exit_notify: Arc<Notify>,
    started_at: Instant,
}

/// PTY-backed `ProcessEnvironment`. Unix only; daemons on other platforms
/// should register only the `standard` and `docker` factories.
pub struct TtyEnvironment {
    id: String,
    config: EnvironmentConfiguration,
    state: AtomicU8,
    event_bus: EventBus,
    console: Arc<ConsoleBuffer>,
    log_callback: Arc<RwLock<Option<LogCallback>>>,
    child: Arc<RwLock<Option<RunningChild>>>,
    last_exit: Arc<RwLock<Option<ExitState>>>,
}

impl TtyEnvironment {
    pub fn new(config: EnvironmentConfiguration) -> Self {
        Self {
            id: config.id.clone(),
            config,
            state: AtomicU8::new(ProcessState::Offline as u8),
            event_bus: EventBus::new(),
            console: Arc::new(ConsoleBuffer::default()),
            log_callback: Arc::new(RwLock::new(None)),
            child: Arc::new(RwLock::new(None)),
            last_exit: Arc::new(RwLock::new(None)),
        }
    }

    fn u8_to_state(value: u8) -> ProcessState {
        match value {
            0 => ProcessState::Offline,
            1 => ProcessState::Starting,
            2 => ProcessState::Running,
            3 => ProcessState::Stopping,
            _ => ProcessState::Offline,
        }
    }

    fn root(&self) -> std::path::PathBuf {
        self.config.root_directory.clone()
    }
}

#[async_trait]
impl ProcessEnvironment for TtyEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn config(&self) -> &EnvironmentConfiguration {
        &self.config
    }

    async fn create(&self) -> EnvironmentResult<()> {
        std::fs::create_dir_all(self.root())?;
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(self.root())?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(self.root(), perms)?;
        Ok(())
    }

    async fn destroy(&self) -> EnvironmentResult<()> {
        let root = self.root();
        if root.exists() {
            std::fs::remove_dir_all(root)?;
        }
        Ok(())
    }

    async fn exists(&self) -> EnvironmentResult<bool> {
        Ok(self.root().exists())
    }

    async fn start(&self, _ctx: CancellationToken) -> EnvironmentResult<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: CancellationToken) -> EnvironmentResult<()> {
        Ok(())
    }

    async fn wait_for_stop(
        &self,
        ctx: CancellationToken,
        timeout: Duration,
        _terminate: bool,
    ) -> EnvironmentResult<()> {
        self.wait_for_main_process(ctx, Some(timeout)).await
    }

    async fn terminate(&self, _ctx: CancellationToken, signal: &str) -> EnvironmentResult<()> {
        let n = match signal {
            "SIGKILL" => 9,
            "SIGTERM" => 15,
            "SIGINT" => 2,
            "SIGHUP" => 1,
            _ => 15,
        };
        self.send_code(n).await
    }

    fn state(&self) -> ProcessState {
        Self::u8_to_state(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessState) {
        let old = Self::u8_to_state(self.state.swap(state as u8, Ordering::SeqCst));
        if old != state {
            debug!("State change: {} -> {}", old, state);
            self.event_bus.publish_state(state);
        }
    }

    async fn is_running(&self) -> EnvironmentResult<bool> {
        let pid = self.child.read().as_ref().map(|c| c.pid);
        match pid {
            None => Ok(false),
            Some(pid) => Ok(kill(Pid::from_raw(pid as i32), None).is_ok()),
        }
    }

    async fn exit_state(&self) -> EnvironmentResult<ExitState> {
        Ok(self.last_exit.read().clone().unwrap_or(ExitState {
            exit_code: 0,
            oom_killed: false,
            error: None,
        }))
    }

    async fn uptime(&self) -> EnvironmentResult<i64> {
        Ok(self
            .child
            .read()
            .as_ref()
            .map(|c| c.started_at.elapsed().as_millis() as i64)
            .unwrap_or(0))
    }

    async fn attach(&self, _ctx: CancellationToken) -> EnvironmentResult<()> {
        Ok(())
    }

    async fn send_command(&self, cmd: &str) -> EnvironmentResult<()> {
        let tx = self.child.read().as_ref().map(|c| c.stdin_tx.clone());
        match tx {
            Some(tx) => tx
                .send(format!("{cmd}\n"))
                .await
                .map_err(|_| EnvironmentError::ServerOffline),
            None => Err(EnvironmentError::ServerOffline),
        }
    }

    fn set_log_callback(&self, callback: LogCallback) {
        *self.log_callback.write() = Some(callback);
    }

    async fn read_log(&self, lines: u32) -> EnvironmentResult<Vec<String>> {
        let snap = self.console.snapshot();
        let start = snap.lines.len().saturating_sub(lines as usize);
        Ok(snap.lines[start..].to_vec())
    }

    async fn in_situ_update(&self) -> EnvironmentResult<()> {
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.event_bus
    }

    async fn on_before_start(&self, _ctx: CancellationToken) -> EnvironmentResult<()> {
        Ok(())
    }

    fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    async fn get_stats(&self) -> EnvironmentResult<StatSample> {
        let pid = self
            .child
            .read()
            .as_ref()
            .map(|c| c.pid)
            .ok_or(EnvironmentError::ServerOffline)?;

        let mut system = sysinfo::System::new();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        system.refresh_process(sys_pid);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        system.refresh_process(sys_pid);

        match system.process(sys_pid) {
            Some(proc) => Ok(StatSample {
                cpu_percent: proc.cpu_usage() as f64,
                memory_rss_bytes: proc.memory(),
            }),
            None => Ok(StatSample::default()),
        }
    }

    async fn kill(&self) -> EnvironmentResult<()> {
        self.send_code(9).await
    }

    async fn send_code(&self, n: i32) -> EnvironmentResult<()> {
        let pid = self.child.read().as_ref().map(|c| c.pid);
        let Some(pid) = pid else { return Ok(()) };
        if let Ok(signal) = Signal::try_from(n) {
            let _ = kill(Pid::from_raw(pid as i32), signal);
        }
        Ok(())
    }

    async fn wait_for_main_process(
        &self,
        _ctx: CancellationToken,
        timeout: Option<Duration>,
    ) -> EnvironmentResult<()> {
        let notify = self.child.read().as_ref().map(|c| c.exit_notify.clone());
        let Some(notify) = notify else { return Ok(()) };

        match timeout {
            Some(t) if t < Duration::from_secs(u64::MAX / 2) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(t) => {
                        warn!("wait_for_main_process timed out for {}, killing", self.id);
                        self.kill().await?;
                        notify.notified().await;
                    }
                }
            }
            _ => notify.notified().await,
        }
        Ok(())
    }

    async fn execute_async(
        &self,
        program: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
        on_exit: ExitCallback,
    ) -> EnvironmentResult<()> {
        if self.child.read().is_some() {
            return Err(EnvironmentError::AlreadyRunning);
        }

        let root = self.root();
        let OpenptyResult { master, slave } = openpty(None, None).map_err(|e| {
            EnvironmentError::Other(format!("openpty failed: {e}"))
        })?;

        let slave_fd = slave.as_raw_fd();
        let master_std = std::fs::File::from(master);

        self.set_state(ProcessState::Starting);

        let mut command = std::process::Command::new(program);
        command
            .args(&args)
            .current_dir(&root)
            .env("HOME", &root)
            .env("TERM", "xterm")
            .envs(&env);

        // Make the slave the child's controlling terminal: new session,
        // dup the slave onto stdin/stdout/stderr, then drop our copy.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid().ok();
                if nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                nix::unistd::dup2(slave_fd, 0).map_err(std_err)?;
                nix::unistd::dup2(slave_fd, 1).map_err(std_err)?;
                nix::unistd::dup2(slave_fd, 2).map_err(std_err)?;
                Ok(())
            });
        }

        let mut tokio_command = tokio::process::Command::from(command);
        let mut child = tokio_command.spawn().map_err(EnvironmentError::Io)?;
        drop(slave);
        let pid = child.id().unwrap_or(0);

        let master_read = master_std.try_clone().map_err(EnvironmentError::Io)?;
        let master_for_write = master_std;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let exit_notify = Arc::new(Notify::new());

        // Writer: the PTY master is one fd serving both directions, so we
        // wrap it in an async handle for the write side.
        let mut master_write = tokio::fs::File::from_std(master_for_write);
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if master_write.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = master_write.flush().await;
            }
        });

        // Reader: PTYs don't carry a clean EOF the way pipes do; the loop
        // exits when the read errors out after the slave side closes.
        let async_master_read = tokio::fs::File::from_std(master_read);
        let event_bus = self.event_bus.clone();
        let console = self.console.clone();
        let log_cb = self.log_callback.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(async_master_read).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(cb) = log_cb.read().as_ref() {
                            cb(line.as_bytes());
                        }
                        console.append(line.clone());
                        event_bus.publish(Event::ConsoleOutput(format!("{line}\n").into_bytes()));
                    }
                    _ => break,
                }
            }
        });

        *self.child.write() = Some(RunningChild {
            pid,
            stdin_tx,
            exit_notify: exit_notify.clone(),
            started_at: Instant::now(),
        });
        self.set_state(ProcessState::Running);
        info!("Spawned {} (pid {}) on pty for {}", program, pid, self.id);

        let id = self.id.clone();
        let event_bus = self.event_bus.clone();
        let child_slot = self.child.clone();
        let last_exit_slot = self.last_exit.clone();

        tokio::spawn(async move {
            let status = child.wait().await;
            let (graceful, exit_code) = match &status {
                Ok(s) => {
                    use std::os::unix::process::ExitStatusExt;
                    (s.success() && s.signal().is_none(), s.code().unwrap_or(-1) as i64)
                }
                Err(_) => (false, -1),
            };

            *last_exit_slot.write() = Some(ExitState {
                exit_code,
                oom_killed: false,
                error: status.err().map(|e| e.to_string()),
            });

            exit_notify.notify_waiters();
            *child_slot.write() = None;

            event_bus.publish_state(ProcessState::Offline);
            debug!("Child {} reaped for {}, graceful={}", pid, id, graceful);
            on_exit(graceful);
        });

        Ok(())
    }
}

fn std_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> EnvironmentConfiguration {
        EnvironmentConfiguration {
            id: "test".into(),
            root_directory: root.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn execute_async_runs_on_pty_and_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("srv");
        std::fs::create_dir_all(&root).unwrap();
        let env = TtyEnvironment::new(test_config(&root));

        let done = Arc::new(Notify::new());
        let done2 = done.clone();
        let on_exit: ExitCallback = Arc::new(move |_graceful| {
            done2.notify_one();
        });

        env.execute_async("/bin/sh", vec!["-c".into(), "exit 0".into()], HashMap::new(), on_exit)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), done.notified())
            .await
            .expect("child should exit quickly");
    }

    #[tokio::test]
    async fn double_execute_async_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("srv");
        std::fs::create_dir_all(&root).unwrap();
        let env = TtyEnvironment::new(test_config(&root));

        env.execute_async(
            "/bin/sh",
            vec!["-c".into(), "sleep 2".into()],
            HashMap::new(),
            Arc::new(|_| {}),
        )
        .await
        .unwrap();

        let err = env
            .execute_async("/bin/sh", vec![], HashMap::new(), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::AlreadyRunning));

        env.kill().await.unwrap();
    }
}
