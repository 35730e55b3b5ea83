//! Program registry and start queue (4.G)
//!
//! Process-wide map of Programs by id, plus a single-consumer FIFO start
//! queue that serialises crash-restart and auto-restart decisions. A single
//! consumer guarantees a happens-before ordering between a crash-restart
//! decision and its resulting `Start()`, and caps restart storms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Configuration, DockerConfiguration};

use super::configuration::ProgramDefinition;
use super::server::{Program, ProgramError, StartQueueSender};

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("server already exists: {0}")]
    AlreadyExists(String),

    #[error("server not found: {0}")]
    NotFound(String),

    #[error("program error: {0}")]
    Program(#[from] ProgramError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
}

/// Process-wide registry of Programs plus their shared start queue.
pub struct Manager {
    programs: DashMap<String, Arc<Program>>,
    servers_root: PathBuf,
    cache_root: PathBuf,
    docker_config: DockerConfiguration,
    crash_limit: u32,
    start_queue_tx: StartQueueSender,
    shutting_down: Arc<AtomicBool>,
}

impl Manager {
    /// Create a new, empty registry and spin up its start-queue consumer.
    pub fn new(config: &Configuration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let manager = Self {
            programs: DashMap::new(),
            servers_root: config.data.servers.clone(),
            cache_root: config.data.cache.clone(),
            docker_config: config.docker.clone(),
            crash_limit: config.data.crash_limit,
            start_queue_tx: tx,
            shutting_down: shutting_down.clone(),
        };

        spawn_start_queue_consumer(rx, shutting_down);
        manager
    }

    /// Load every `<serverFolder>/<id>.json` definition on disk.
    pub fn load_all(&self) -> Result<(), ManagerError> {
        if !self.servers_root.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.servers_root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let definition: ProgramDefinition = serde_json::from_str(&contents)
                .map_err(|e| ManagerError::InvalidDefinition(e.to_string()))?;
            let id = definition.identifier.clone();
            if let Err(e) = self.create_internal(definition) {
                warn!("failed to load program {}: {}", id, e);
            }
        }
        info!("loaded {} program(s) from {}", self.programs.len(), self.servers_root.display());
        Ok(())
    }

    /// `Get(id)`
    pub fn get(&self, id: &str) -> Option<Arc<Program>> {
        self.programs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// `GetAll()`
    pub fn get_all(&self) -> Vec<Arc<Program>> {
        self.programs.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn count(&self) -> usize {
        self.programs.len()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.programs.contains_key(id)
    }

    /// `Create(p)`
    pub fn create(&self, definition: ProgramDefinition) -> Result<Arc<Program>, ManagerError> {
        if self.exists(&definition.identifier) {
            return Err(ManagerError::AlreadyExists(definition.identifier));
        }
        self.create_internal(definition)
    }

    fn create_internal(&self, definition: ProgramDefinition) -> Result<Arc<Program>, ManagerError> {
        let id = definition.identifier.clone();
        let program = Arc::new(Program::new(
            definition,
            &self.servers_root,
            &self.cache_root,
            &self.docker_config,
            self.crash_limit,
            self.start_queue_tx.clone(),
        )?);
        self.programs.insert(id, Arc::clone(&program));
        Ok(program)
    }

    /// `Delete(id)`: runs `Destroy()` then removes from the registry.
    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        let program = self
            .programs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        program
            .destroy()
            .await
            .map_err(|e| ManagerError::InvalidDefinition(e.to_string()))?;
        self.programs.remove(id);
        Ok(())
    }

    /// `Reload(id)`: re-parses the definition from disk and copies fields
    /// into the cached Program, preserving its Environment.
    pub fn reload(&self, id: &str) -> Result<(), ManagerError> {
        let program = self.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let path = self.servers_root.join(format!("{id}.json"));
        let contents = std::fs::read_to_string(&path)?;
        let definition: ProgramDefinition = serde_json::from_str(&contents)
            .map_err(|e| ManagerError::InvalidDefinition(e.to_string()))?;
        program.replace_definition(definition);
        Ok(())
    }

    /// Push a program onto the start queue (used by HTTP `auto_start`
    /// bootstrapping as well as `Program::on_exit`'s auto-restart path).
    pub fn enqueue_start(&self, program: Arc<Program>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("start queue disabled during shutdown, dropping enqueue for {}", program.id());
            return;
        }
        let _ = self.start_queue_tx.send(program);
    }

    /// Graceful service shutdown: stop accepting new queue entries, issue
    /// `Stop()` to every running Program and wait (bounded) for each.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for program in self.get_all() {
            let _ = program.stop().await;
            let _ = program
                .wait_for_main_process(Some(std::time::Duration::from_secs(30)))
                .await;
        }
    }
}

/// Single-consumer task draining the start queue. Wakes once per second or
/// on push; for each dequeued entry, starts it iff not already running and
/// ignores any error (the program's own console already displays it).
fn spawn_start_queue_consumer(
    mut rx: mpsc::UnboundedReceiver<Arc<Program>>,
    shutting_down: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                maybe_program = rx.recv() => {
                    match maybe_program {
                        Some(program) => drain_one(program, &shutting_down).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {}
            }
        }
    });
}

async fn drain_one(program: Arc<Program>, shutting_down: &Arc<AtomicBool>) {
    if shutting_down.load(Ordering::SeqCst) {
        return;
    }
    debug!("start queue: dequeued {}", program.id());
    if !program.environment().is_running().await.unwrap_or(false) {
        if let Err(e) = program.start().await {
            warn!("start queue: start failed for {}: {}", program.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::configuration::{Execution, Variables};
    use std::collections::HashMap as Map;
    use std::io::Write;

    fn test_config(dir: &std::path::Path) -> Configuration {
        let config_path = dir.join("config.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [listen]
            web = "0.0.0.0:8080"

            [auth]
            url = "https://panel.example"
            client_id = "x"
            client_secret = "y"
            "#
        )
        .unwrap();
        Configuration::load(config_path.to_str().unwrap()).unwrap()
    }

    fn test_definition(id: &str) -> ProgramDefinition {
        ProgramDefinition {
            identifier: id.to_string(),
            display: id.to_string(),
            kind: "standard".to_string(),
            variables: Variables::new(),
            execution: Execution {
                program: "/bin/echo".to_string(),
                arguments: Vec::new(),
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

    #[test]
    fn empty_registry_has_no_programs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = Manager::new(&config);
        assert_eq!(manager.count(), 0);
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn create_then_duplicate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = Manager::new(&config);

        let definition = test_definition("prog-a");
        manager.create(definition.clone()).unwrap();
        let err = manager.create(definition).unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyExists(_)));
    }
}
