//! Daemon infrastructure.
//!
//! Hosts the orchestrator as a long-running service: one watcher thread
//! per healthy account binding, a periodic reconciliation timer, PID file
//! management, and graceful shutdown. In-flight sync operations run to
//! completion on shutdown; only the watchers stop immediately.

use crate::config::{parse_duration, Config};
use crate::credentials::{CredentialResolver, EnvCredentials};
use crate::orchestrator::Orchestrator;
use crate::watcher::{FolderEvent, RootWatcher};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

/// Daemon-level status for reporting
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub uptime: Duration,
    pub next_cycle_in: Option<Duration>,
}

impl Daemon {
    /// Create a daemon over the default environment-variable credential
    /// resolver
    pub fn new(config: Config) -> Result<Self> {
        Self::with_resolver(config, Arc::new(EnvCredentials))
    }

    pub fn with_resolver(config: Config, resolver: Arc<dyn CredentialResolver>) -> Result<Self> {
        let orchestrator = Orchestrator::new(config.clone(), resolver)
            .context("Failed to create orchestrator")?;

        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = if !config.daemon.pid_file.is_empty() {
            Some(PathBuf::from(&config.daemon.pid_file))
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run the daemon in the foreground until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting repovault daemon");

        self.config.validate().context("Invalid configuration")?;
        self.write_pid_file().context("Failed to write PID file")?;

        self.is_running.store(true, Ordering::SeqCst);
        self.orchestrator.set_running(true);

        // Accounts that cannot authenticate are excluded; the rest start
        let healthy = self.orchestrator.verify_accounts().await;
        if healthy.is_empty() {
            warn!("No account could authenticate; running with watchers disabled");
        }

        // Pick up projects that appeared while the daemon was down
        self.orchestrator.initial_scan(&healthy).await;

        let settle_delay = self.config.settle_delay()?;
        let (event_tx, event_rx) = mpsc::channel::<FolderEvent>(64);

        let mut watchers = Vec::new();
        for binding in healthy {
            watchers.push(RootWatcher::start(
                binding,
                self.config.detection.clone(),
                settle_delay,
                event_tx.clone(),
            ));
        }
        drop(event_tx);

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let is_running = Arc::clone(&self.is_running);
        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon");
            is_running.store(false, Ordering::SeqCst);
            let _ = shutdown_sender.send(());
        });

        let result = self.daemon_loop(event_rx, shutdown_receiver).await;

        for mut watcher in watchers {
            watcher.stop();
        }

        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Main loop: folder events, the periodic cycle, and shutdown
    async fn daemon_loop(
        &self,
        mut events: mpsc::Receiver<FolderEvent>,
        mut shutdown_receiver: broadcast::Receiver<()>,
    ) -> Result<()> {
        let cycle_interval = self
            .config
            .cycle_interval()
            .context("Failed to parse cycle interval")?;
        let mut timer = interval(cycle_interval);

        info!("Daemon loop started with cycle interval {:?}", cycle_interval);

        // The immediate first tick duplicates the initial scan
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown received in daemon loop");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Folder event: {}", event.path.display());
                            self.orchestrator.on_folder_detected(event).await;
                        }
                        None => {
                            // All watchers gone; keep cycling on the timer
                            debug!("Watcher channel closed");
                        }
                    }
                }

                _ = timer.tick() => {
                    if !self.is_running.load(Ordering::SeqCst) {
                        break;
                    }
                    let result = self.orchestrator.run_cycle().await;
                    if result.failed() > 0 {
                        warn!(
                            "Cycle finished with {} failures out of {} repositories",
                            result.failed(),
                            result.outcomes.len()
                        );
                    }
                }
            }
        }

        self.orchestrator.set_running(false);
        info!("Daemon loop exiting");
        Ok(())
    }

    /// Detach into the background (Unix)
    #[cfg(unix)]
    pub fn daemonize(&self) -> Result<()> {
        use daemonize::Daemonize;

        let log_file = if !self.config.daemon.log_file.is_empty() {
            let path = PathBuf::from(&self.config.daemon.log_file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            Some(fs::File::create(&path).context("Failed to create log file")?)
        } else {
            None
        };

        let mut daemonize = Daemonize::new();

        if let Some(pid_path) = &self.pid_file_path {
            daemonize = daemonize.pid_file(pid_path);
        }

        if let Some(log_file) = log_file {
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        info!("repovault daemon started as background service");
        Ok(())
    }

    /// Stop a running daemon via its PID file
    pub async fn stop(&self) -> Result<()> {
        info!("Sending shutdown signal to daemon");

        let Some(pid_file) = &self.pid_file_path else {
            warn!("No PID file configured, cannot stop daemon");
            return Ok(());
        };

        if !pid_file.exists() {
            warn!("PID file not found, daemon may not be running");
            return Ok(());
        }

        let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
        let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .context("Failed to send SIGTERM to daemon process")?;
        }

        #[cfg(not(unix))]
        {
            warn!("Daemon stop not implemented for this platform");
        }

        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(())
    }

    /// Daemon-level status
    pub fn status(&self, start_time: Instant) -> DaemonStatus {
        let is_running = self.is_running.load(Ordering::SeqCst);

        let next_cycle_in = if is_running {
            parse_duration(&self.config.daemon.cycle_interval).ok()
        } else {
            None
        };

        DaemonStatus {
            is_running,
            uptime: start_time.elapsed(),
            next_cycle_in,
        }
    }

    async fn wait_for_shutdown_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => debug!("SIGINT received"),
                _ = sigterm.recv() => debug!("SIGTERM received"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl-c");
            debug!("Ctrl+C received");
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.orchestrator.set_running(false);
        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Check whether a daemon is currently running via the configured PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    if config.daemon.pid_file.is_empty() {
        return Ok(false);
    }

    let pid_file = PathBuf::from(&config.daemon.pid_file);
    if !pid_file.exists() {
        return Ok(false);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(true),
            Err(Errno::ESRCH) => {
                // Stale PID file
                let _ = fs::remove_file(&pid_file);
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(true)
    }
}
