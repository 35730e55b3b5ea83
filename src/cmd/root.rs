//! Main daemon command - starts the daemon server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use stellar_daemon::config::Configuration;
use stellar_daemon::router::{self, AppState};
use stellar_daemon::server::Manager;

/// What a signal handler asked the main loop to do once the current
/// listeners have drained.
enum SignalOutcome {
    /// `SIGHUP`: re-read `config.toml` and re-open the HTTP/SFTP listeners.
    Reload,
    /// `SIGTERM`: stop serving for good.
    Shutdown,
}

/// Run the main daemon.
///
/// Loops so that `SIGHUP` can tear down and rebuild the HTTP/SFTP listeners
/// against freshly-loaded configuration without losing the running
/// [`Manager`] (and therefore without restarting any program).
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let mut config = Arc::new(Configuration::load(config_path)?);

    info!("Configuration loaded successfully");
    info!("  Web listener: {}", config.listen.web);
    info!("  SFTP listener: {}", config.listen.sftp);
    info!("  Data directory: {}", config.data.servers.display());

    info!("Loading persisted programs...");
    let manager = Arc::new(Manager::new(&config));
    manager.load_all()?;
    info!("Loaded {} program(s)", manager.count());

    for program in manager.get_all() {
        if program.definition().execution.auto_start {
            manager.enqueue_start(program);
        }
    }

    loop {
        let state = AppState {
            manager: manager.clone(),
            config: config.clone(),
        };
        let app = router::build_router(state);

        let bind_addr: SocketAddr = config
            .listen
            .web
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen.web address '{}': {}", config.listen.web, e))?;

        let handle = axum_server::Handle::new();
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        spawn_signal_handlers(manager.clone(), handle.clone(), signal_tx);
        let sftp_handle = spawn_sftp_server(manager.clone(), config.clone());

        if !config.listen.web_cert.is_empty() && !config.listen.web_key.is_empty() {
            info!("Starting HTTPS listener on {}", bind_addr);
            let tls_config = RustlsConfig::from_pem_file(&config.listen.web_cert, &config.listen.web_key)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load TLS config: {}", e))?;

            axum_server::bind_rustls(bind_addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        } else {
            info!("Starting HTTP listener on {}", bind_addr);
            axum_server::bind(bind_addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }

        sftp_handle.abort();

        match signal_rx.recv().await {
            Some(SignalOutcome::Reload) => {
                info!("reloading configuration from {}", config_path);
                config = Arc::new(Configuration::load(config_path)?);
                info!("re-opening listeners: web={} sftp={}", config.listen.web, config.listen.sftp);
                continue;
            }
            Some(SignalOutcome::Shutdown) | None => break,
        }
    }

    info!("Daemon stopped");
    Ok(())
}

/// Runs the SFTP listener in the background for the current listener
/// generation; aborted and respawned whenever the main loop reloads.
fn spawn_sftp_server(manager: Arc<Manager>, config: Arc<Configuration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = stellar_daemon::sftp::start_server(&config.listen, &config.auth, manager).await {
            error!("SFTP server exited: {}", e);
        }
    })
}

/// `SIGTERM` triggers graceful shutdown, `SIGHUP` reloads every program's
/// on-disk definition plus `config.toml` and re-opens the HTTP/SFTP
/// listeners, `SIGPIPE` is ignored (spec §6 Signals).
#[cfg(unix)]
fn spawn_signal_handlers(
    manager: Arc<Manager>,
    handle: axum_server::Handle,
    outcome_tx: mpsc::Sender<SignalOutcome>,
) {
    use nix::sys::signal::{self, SigHandler, Signal};
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    // The default SIGPIPE disposition terminates the process; writing to a
    // closed socket/pipe must instead surface as an EPIPE Result.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hup = unix_signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = term.recv() => {
                warn!("received SIGTERM, shutting down gracefully");
                manager.shutdown().await;
                let _ = outcome_tx.send(SignalOutcome::Shutdown).await;
                handle.graceful_shutdown(Some(Duration::from_secs(30)));
            }
            _ = hup.recv() => {
                info!("received SIGHUP, reloading program definitions");
                for program in manager.get_all() {
                    if let Err(e) = manager.reload(&program.id()) {
                        error!("failed to reload {}: {}", program.id(), e);
                    }
                }
                let _ = outcome_tx.send(SignalOutcome::Reload).await;
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handlers(
    manager: Arc<Manager>,
    handle: axum_server::Handle,
    outcome_tx: mpsc::Sender<SignalOutcome>,
) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        warn!("received shutdown signal, stopping servers...");
        manager.shutdown().await;
        let _ = outcome_tx.send(SignalOutcome::Shutdown).await;
        handle.graceful_shutdown(Some(Duration::from_secs(30)));
    });
}
