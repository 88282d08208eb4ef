//! Daemon Infrastructure - Background service for scheduled crossposting
//!
//! This module runs the crossposting cycle on a fixed interval, with PID file
//! management and graceful shutdown handling. Cycles run inline in the loop,
//! so a slow cycle delays the next tick instead of overlapping it.

use crate::cycle::{CrosspostCycle, CycleOutcome, CycleReport};
use crate::Config;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Daemon state and control
pub struct Daemon {
    cycle: Arc<CrosspostCycle>,
    poll_interval: Duration,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Result<Self> {
        let cycle = CrosspostCycle::from_config(&config)
            .context("Failed to create crossposting cycle for daemon")?;
        Self::with_cycle(config, Arc::new(cycle))
    }

    /// Create a daemon around an existing cycle
    pub fn with_cycle(config: Config, cycle: Arc<CrosspostCycle>) -> Result<Self> {
        let poll_interval = config.poll_interval()?;
        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = if !config.daemon.pid_file.is_empty() {
            Some(PathBuf::from(&config.daemon.pid_file))
        } else {
            None
        };

        Ok(Self {
            cycle,
            poll_interval,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
        })
    }

    /// Handle for stopping the daemon from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Start the daemon in the foreground
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting crossposter daemon");

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let is_running = self.is_running.clone();

        // Spawn shutdown signal handler
        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            is_running.store(false, Ordering::SeqCst);
            let _ = shutdown_sender.send(());
        });

        let result = self.daemon_loop(shutdown_receiver).await;

        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Main daemon loop - one cycle immediately, then one per interval
    async fn daemon_loop(&self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let mut interval_timer = interval(self.poll_interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Daemon loop started with interval: {:?}", self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = interval_timer.tick() => {
                    if !self.is_running.load(Ordering::SeqCst) {
                        break;
                    }

                    debug!("Starting scheduled crossposting cycle");
                    let report = self.cycle.run().await;
                    Self::log_cycle(&report);
                }
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    /// Wait for shutdown signals (SIGTERM, SIGINT, Ctrl+C)
    async fn wait_for_shutdown_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                        _ = sigterm.recv() => debug!("SIGTERM received"),
                    }
                    return;
                }
                Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        debug!("Ctrl+C received");
    }

    /// Write PID file for daemon process management
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

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }

    fn log_cycle(report: &CycleReport) {
        match &report.outcome {
            CycleOutcome::Completed if report.failed > 0 => warn!(
                "Cycle finished with {} failed publishes ({} published)",
                report.failed, report.published
            ),
            CycleOutcome::Completed => debug!(
                "Cycle finished: {} published, watermark {}",
                report.published, report.watermark
            ),
            CycleOutcome::FetchFailed(e) => warn!("Cycle skipped, feed unavailable: {}", e),
            CycleOutcome::TimedOut => warn!("Cycle abandoned after timeout"),
            CycleOutcome::Skipped => debug!("Cycle skipped, previous one still running"),
        }
    }
}

/// Detach into the background (Unix platforms).
///
/// Must be called before any async runtime is started: only the calling
/// thread survives the fork.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new();

    if !config.daemon.pid_file.is_empty() {
        daemonize = daemonize.pid_file(&config.daemon.pid_file);
    }

    if !config.daemon.log_file.is_empty() {
        let log_path = PathBuf::from(&config.daemon.log_file);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;
        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;
    Ok(())
}

/// Read the PID recorded in the configured PID file
fn read_pid(config: &Config) -> Result<Option<i32>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }

    let pid_file = PathBuf::from(&config.daemon.pid_file);
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in PID file")?;
    // 0 and negative values address process groups, not a single daemon
    if pid <= 0 {
        return Err(anyhow!("Invalid PID in PID file: {}", pid));
    }
    Ok(Some(pid))
}

/// Stop a running daemon by sending SIGTERM
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid) = read_pid(config)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    };

    send_terminate(pid)
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some(pid) = read_pid(config)? else {
        return Ok(false);
    };

    if !process_exists(pid) {
        // Process doesn't exist, remove stale PID file
        let _ = fs::remove_file(&config.daemon.pid_file);
        return Ok(false);
    }

    Ok(true)
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<bool> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .context("Failed to send SIGTERM to daemon process")?;
    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(true)
}

#[cfg(not(unix))]
fn send_terminate(pid: i32) -> Result<bool> {
    warn!("Daemon stop not implemented for this platform (PID {})", pid);
    Ok(false)
}

#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true, // Assume running if we can't check
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: i32) -> bool {
    true
}
