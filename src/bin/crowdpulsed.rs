//! CrowdPulse daemon - per-camera control plane
//!
//! Runs the session registry, the stream readers, the worker supervisor,
//! peer discovery and the local control API in one process.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! crowdpulsed start
//!
//! # Start with an explicit config file, in the background
//! crowdpulsed start -d --config /etc/crowdpulse/crowdpulse.toml
//!
//! # Stop the daemon
//! crowdpulsed stop
//!
//! # Check daemon status
//! crowdpulsed status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crowdpulse_core::DEFAULT_PEER_PORT;
use crowdpulsed::api::ControlApiServer;
use crowdpulsed::assets;
use crowdpulsed::config::{self, device_stream_url, Config};
use crowdpulsed::discovery::{HttpPeerInfoSource, PeerPoller};
use crowdpulsed::reader::{metadata_channel, RtspTransportFactory};
use crowdpulsed::registry::{spawn_registry, HostEvent, RegistryHandle, RegistrySettings};
use crowdpulsed::supervisor::{spawn_supervisor, SupervisorConfig};
use crowdpulsed::worker_client::{spawn_metadata_forwarder, WorkerClient};

/// CrowdPulse daemon - camera analytics control plane
#[derive(Parser, Debug)]
#[command(name = "crowdpulsed", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Path to the TOML config file
        #[arg(short, long, env = "CROWDPULSE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn runtime_state_dir() -> PathBuf {
    config::state_dir().unwrap_or_else(|| PathBuf::from("/tmp/crowdpulse"))
}

fn pid_file_path() -> PathBuf {
    runtime_state_dir().join("crowdpulsed.pid")
}

fn log_file_path() -> PathBuf {
    runtime_state_dir().join("crowdpulsed.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'crowdpulsed stop' to stop it first.");
                process::exit(1);
            }

            // Resolve before daemonizing, which changes the working directory.
            let config_path = config.map(|p| fs::canonicalize(&p).unwrap_or(p));
            let config = Config::load(config_path.as_deref())
                .context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // The worker gets its own stop timeout before being killed.
                for _ in 0..400 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 40 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

/// Log filter: `RUST_LOG` when set and valid, else the crate defaults.
fn env_filter(enable_output: bool, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Ignoring invalid RUST_LOG: {e}"),
        }
    }
    let level = if enable_output { "debug" } else { "info" };
    EnvFilter::new(format!(
        "warn,crowdpulsed={level},crowdpulse_core={level},crowdpulse_protocol={level}"
    ))
}

fn init_tracing(config: &Config) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.enable_output, rust_log.as_deref()))
        .init();
}

#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "CrowdPulse daemon starting"
    );

    let worker_dir = config.worker_dir();
    if config.disable_unpack {
        info!(dir = %worker_dir.display(), "Asset unpack disabled");
    } else {
        let copied = assets::unpack_async(config.asset_dir.clone(), worker_dir.clone())
            .await
            .context("Failed to unpack worker assets")?;
        info!(files = copied, dir = %worker_dir.display(), "Worker assets unpacked");
    }

    let cancel_token = CancellationToken::new();
    let (metadata_tx, metadata_rx) = metadata_channel();

    let supervisor = spawn_supervisor(SupervisorConfig {
        program: config.worker_exec.clone(),
        module: config.worker_module.clone(),
        restart_delay: config.restart_delay(),
        stop_timeout: config.stop_timeout(),
        forward_output: config.enable_output,
    });

    let api = ControlApiServer::bind().await?;
    let registry = spawn_registry(
        RegistrySettings {
            work_dir: worker_dir,
            web_app_port: config.web_app_port,
            control_api_port: api.port(),
            auto_restart: config.auto_restart,
        },
        supervisor,
        Arc::new(RtspTransportFactory),
        metadata_tx,
    );
    info!("Session registry started");

    let worker = WorkerClient::new(&config.web_app_url())?;
    let _forwarder = spawn_metadata_forwarder(metadata_rx, worker, cancel_token.clone());

    let source = HttpPeerInfoSource::new(&config.peer_url)?;
    info!(url = %source.url(), "Polling peer for server info");
    let _poller = PeerPoller::new(Arc::new(source), registry.clone()).spawn(cancel_token.clone());

    spawn_event_logger(&registry, cancel_token.clone());
    attach_configured_devices(&config, &registry).await;

    let signal_registry = registry.clone();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(&signal_registry).await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let served = api.run(registry.clone(), cancel_token.clone()).await;
    cancel_token.cancel();

    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Registry already stopped");
    }

    if let Err(e) = served {
        error!(error = %e, "Control API error");
        return Err(e.into());
    }

    info!("CrowdPulse daemon stopped");
    Ok(())
}

/// Logs host-bound events; the host integration consumes the same stream.
fn spawn_event_logger(registry: &RegistryHandle, cancel: CancellationToken) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(HostEvent::Analytics { device_id, event, timestamp }) => info!(
                    device_id = %device_id,
                    event_type = %event.event_type,
                    caption = %event.caption,
                    %timestamp,
                    "Analytics event"
                ),
                Ok(HostEvent::Diagnostic(diag)) => info!(
                    level = %diag.level,
                    caption = %diag.caption,
                    description = %diag.description,
                    "Diagnostic event"
                ),
                Ok(other) => debug!(?other, "Host event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Attaches the devices listed in the config. Without an explicit `url`
/// the registry derives one from the peer port and moves it once the port
/// is discovered.
async fn attach_configured_devices(config: &Config, registry: &RegistryHandle) {
    for device in &config.devices {
        let attached = match &device.url {
            Some(_) => match device_stream_url(device, DEFAULT_PEER_PORT) {
                Ok(url) => registry.attach(device.id.clone(), url).await,
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "Skipping device with bad stream url");
                    continue;
                }
            },
            None => registry.attach_derived(device.id.clone()).await,
        };

        if let Err(e) = attached {
            warn!(device_id = %device.id, error = %e, "Failed to attach device");
            continue;
        }
        if let Err(e) = registry.media_started(device.id.clone()).await {
            warn!(device_id = %device.id, error = %e, "Failed to start device media");
        }
    }
}

/// Waits for SIGTERM or SIGINT. SIGHUP restarts the worker and keeps waiting.
async fn handle_signals(registry: &RegistryHandle) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, restarting worker");
                    if let Err(e) = registry.restart_worker().await {
                        warn!(error = %e, "Worker restart failed");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = registry;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_replaces_defaults() {
        let filter = env_filter(false, Some("crowdpulsed=warn"));
        assert_eq!(filter.to_string(), "crowdpulsed=warn");
    }

    #[test]
    fn test_defaults_without_rust_log() {
        let filter = env_filter(false, None).to_string();
        assert!(filter.contains("crowdpulsed=info"));
        assert!(filter.contains("crowdpulse_protocol=info"));

        let filter = env_filter(true, Some("  ")).to_string();
        assert!(filter.contains("crowdpulsed=debug"));
    }

    #[test]
    fn test_invalid_rust_log_falls_back() {
        let filter = env_filter(false, Some("crowdpulsed=loud")).to_string();
        assert!(filter.contains("crowdpulsed=info"));
    }
}
