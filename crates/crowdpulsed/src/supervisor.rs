//! Worker process supervisor.
//!
//! Owns the analytics worker process: launches it with the current
//! parameters, re-logs its output, restarts it after an unexpected exit and
//! stops it gracefully (SIGTERM, then SIGKILL after a grace period).
//!
//! The supervisor runs as its own task and is driven through a
//! [`SupervisorHandle`], so a slow stop never blocks callers that only
//! queue commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Spawn failures are reported through the start callback
//! - Channel errors are mapped to `SupervisorError::ChannelClosed`

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

const COMMAND_BUFFER: usize = 16;

/// Called after every launch attempt with whether the process started.
pub type OnStarted = Arc<dyn Fn(bool) + Send + Sync>;

/// Static launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Program to execute.
    pub program: String,
    /// Module passed with `-m`.
    pub module: String,
    /// Delay before restarting after an unexpected exit.
    pub restart_delay: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// Re-log the worker's stdout/stderr.
    pub forward_output: bool,
}

/// Per-launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParameters {
    pub work_dir: PathBuf,
    pub web_app_port: u16,
    pub control_api_port: u16,
    pub peer_port: u16,
    pub auto_restart: bool,
}

impl WorkerParameters {
    /// Command-line arguments for the worker.
    pub fn arguments(&self, module: &str) -> Vec<String> {
        vec![
            "-m".to_string(),
            module.to_string(),
            "--web-app-port".to_string(),
            self.web_app_port.to_string(),
            "--crowdpulse-plugin-port".to_string(),
            self.control_api_port.to_string(),
            "--mediaserver-port".to_string(),
            self.peer_port.to_string(),
        ]
    }
}

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No process and nothing scheduled.
    #[default]
    Idle,
    /// The worker process is running.
    Running,
    /// A graceful stop is in progress.
    Stopping,
    /// The worker exited unexpectedly; a restart is scheduled.
    RestartPending,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::RestartPending => write!(f, "restart pending"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor task has ended.
    #[error("supervisor channel closed")]
    ChannelClosed,
}

enum SupervisorCommand {
    Start {
        params: WorkerParameters,
        on_started: OnStarted,
    },
    UpdateParameters(WorkerParameters),
    Stop {
        done: oneshot::Sender<()>,
    },
    Restart,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap-to-clone handle to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<SupervisorState>,
    launches: watch::Receiver<u64>,
}

impl SupervisorHandle {
    /// Launches the worker with `params`, replacing any running instance.
    ///
    /// `on_started` runs after this and every later (re)launch.
    pub async fn start(
        &self,
        params: WorkerParameters,
        on_started: OnStarted,
    ) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::Start { params, on_started }).await
    }

    /// Replaces the parameters used by the next launch.
    pub async fn update_parameters(&self, params: WorkerParameters) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::UpdateParameters(params)).await
    }

    /// Stops the worker and disables auto-restart until the next start.
    ///
    /// Returns once the process is gone.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Stop { done: tx }).await?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Stops the worker, then launches it again with the current parameters.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::Restart).await
    }

    /// Stops the worker and ends the supervisor task.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown { done: tx }).await?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Watches the number of successful launches.
    pub fn launches(&self) -> watch::Receiver<u64> {
        self.launches.clone()
    }

    async fn send(&self, cmd: SupervisorCommand) -> Result<(), SupervisorError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SupervisorError::ChannelClosed)
    }
}

/// Spawns the supervisor task.
pub fn spawn_supervisor(config: SupervisorConfig) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
    let (launch_tx, launch_rx) = watch::channel(0);

    let supervisor = Supervisor {
        receiver: cmd_rx,
        config,
        params: None,
        on_started: None,
        auto_restart: false,
        child: None,
        restart_at: None,
        state: state_tx,
        launches: launch_tx,
    };
    tokio::spawn(supervisor.run());

    SupervisorHandle {
        sender: cmd_tx,
        state: state_rx,
        launches: launch_rx,
    }
}

// ============================================================================
// Supervisor Task
// ============================================================================

struct Supervisor {
    receiver: mpsc::Receiver<SupervisorCommand>,
    config: SupervisorConfig,
    params: Option<WorkerParameters>,
    on_started: Option<OnStarted>,
    auto_restart: bool,
    child: Option<Child>,
    restart_at: Option<Instant>,
    state: watch::Sender<SupervisorState>,
    launches: watch::Sender<u64>,
}

impl Supervisor {
    async fn run(mut self) {
        debug!("Worker supervisor starting");

        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Some(done) = self.handle_command(cmd).await {
                        let _ = done.send(());
                        return;
                    }
                }
                status = wait_child(&mut self.child) => {
                    self.handle_exit(status);
                }
                _ = restart_timer(restart_at) => {
                    self.restart_at = None;
                    info!("Restarting worker after unexpected exit");
                    self.launch();
                }
            }
        }

        // Every handle dropped.
        self.stop_process().await;
        debug!("Worker supervisor stopped");
    }

    /// Returns the shutdown acknowledgement when the task should end.
    async fn handle_command(&mut self, cmd: SupervisorCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            SupervisorCommand::Start { params, on_started } => {
                self.stop_process().await;
                self.auto_restart = params.auto_restart;
                self.params = Some(params);
                self.on_started = Some(on_started);
                self.launch();
            }
            SupervisorCommand::UpdateParameters(params) => {
                debug!(?params, "Worker parameters updated");
                self.auto_restart = params.auto_restart;
                self.params = Some(params);
            }
            SupervisorCommand::Stop { done } => {
                self.stop_process().await;
                let _ = done.send(());
            }
            SupervisorCommand::Restart => {
                if self.params.is_none() {
                    warn!("Restart requested before the worker was ever started");
                    return None;
                }
                self.stop_process().await;
                self.auto_restart = self.params.as_ref().is_some_and(|p| p.auto_restart);
                self.launch();
            }
            SupervisorCommand::Shutdown { done } => {
                self.stop_process().await;
                debug!("Worker supervisor shut down");
                return Some(done);
            }
        }
        None
    }

    fn launch(&mut self) {
        let Some(params) = self.params.clone() else {
            return;
        };

        let args = params.arguments(&self.config.module);
        info!(
            program = %self.config.program,
            args = ?args,
            work_dir = %params.work_dir.display(),
            "Launching worker"
        );

        let forward = self.config.forward_output;
        let output = || if forward { Stdio::piped() } else { Stdio::null() };
        let spawned = Command::new(&self.config.program)
            .args(&args)
            .current_dir(&params.work_dir)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true)
            .spawn();

        let started = match spawned {
            Ok(mut child) => {
                info!(pid = ?child.id(), "Worker started");
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(forward_output(stdout, "stdout"));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_output(stderr, "stderr"));
                }
                self.child = Some(child);
                self.launches.send_modify(|n| *n += 1);
                self.state.send_replace(SupervisorState::Running);
                true
            }
            Err(e) => {
                warn!(program = %self.config.program, error = %e, "Worker failed to start");
                self.state.send_replace(SupervisorState::Idle);
                false
            }
        };

        if let Some(on_started) = &self.on_started {
            on_started(started);
        }
    }

    fn handle_exit(&mut self, status: std::io::Result<ExitStatus>) {
        self.child = None;
        match status {
            Ok(status) => warn!(%status, "Worker exited"),
            Err(e) => warn!(error = %e, "Failed to wait for worker"),
        }

        if self.auto_restart {
            self.restart_at = Some(Instant::now() + self.config.restart_delay);
            self.state.send_replace(SupervisorState::RestartPending);
            info!(delay = ?self.config.restart_delay, "Worker restart scheduled");
        } else {
            self.state.send_replace(SupervisorState::Idle);
        }
    }

    /// Terminates the running worker. The exit is not treated as a crash.
    async fn stop_process(&mut self) {
        self.auto_restart = false;
        self.restart_at = None;

        let Some(mut child) = self.child.take() else {
            self.state.send_replace(SupervisorState::Idle);
            return;
        };

        self.state.send_replace(SupervisorState::Stopping);
        info!(pid = ?child.id(), "Stopping worker");

        #[cfg(unix)]
        {
            if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
                // SAFETY: plain signal delivery to a child we own.
                let _ = unsafe { libc::kill(pid, libc::SIGTERM) };
            }
        }

        match timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Worker stopped"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for worker"),
            Err(_) => {
                warn!(timeout = ?self.config.stop_timeout, "Worker ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill worker");
                }
            }
        }

        self.state.send_replace(SupervisorState::Idle);
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn restart_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "crowdpulsed::worker", stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(stream, error = %e, "Worker output closed");
                break;
            }
        }
    }
}
