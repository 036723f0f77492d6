//! probemon daemon - serves probes to peer processes
//!
//! Binds the first free port of the service window, starts the configured
//! auto-start probes, dials the default gateway (if any) and accepts peer
//! connections until stopped.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! probemond start
//!
//! # Start the daemon (background/daemonized)
//! probemond start -d
//!
//! # Start with a config file
//! probemond start --config /etc/probemon.toml
//!
//! # Stop the daemon
//! probemond stop
//!
//! # Check daemon status
//! probemond status
//!
//! # Enable debug logging
//! RUST_LOG=probemond=debug probemond start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use probemon_core::ProbeClasses;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use probemond::config::ProbemonConfig;
use probemond::probes::register_builtin;
use probemond::router::Router;
use probemond::server::ProbeServer;
use probemond::stats::StatsHub;

/// probemon daemon - remotely observable probes
#[derive(Parser, Debug)]
#[command(name = "probemond", version, about)]
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

        /// Configuration file (defaults to $PROBEMON_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("probemon")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("probemond.pid")
}

/// Returns the path to the file recording the bound port.
fn port_file_path() -> PathBuf {
    state_dir().join("probemond.port")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("probemond.log")
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_number(path: &Path, value: impl std::fmt::Display) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write!(file, "{value}").with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Removes the PID and port files.
fn remove_state_files() {
    let _ = fs::remove_file(pid_file_path());
    let _ = fs::remove_file(port_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_number::<u32>(&pid_file_path()) {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file
        remove_state_files();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
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
                eprintln!("Use 'probemond stop' to stop it first.");
                process::exit(1);
            }

            // Fail on a bad config before forking
            let config = ProbemonConfig::load(config.as_deref()).context("Failed to load configuration")?;

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            write_number(&pid_file_path(), process::id())?;
            let result = run_daemon(config);
            remove_state_files();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Some(port) = read_number::<u16>(&port_file_path()) {
                    println!("Port: {port}");
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon on a fresh multi-threaded runtime.
fn run_daemon(config: ProbemonConfig) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?
        .block_on(serve(config))
}

/// Async entry point.
async fn serve(config: ProbemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("probemond=info".parse()?)
                .add_directive("probemon_core=info".parse()?)
                .add_directive("probemon_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        app = %config.app_name,
        "probemon daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let stats = StatsHub::new();
    let mut classes = ProbeClasses::new();
    register_builtin(&mut classes, &stats);

    let gateway = config.gateway.clone();
    let router = Router::new(config, classes, stats);

    let server = ProbeServer::bind(router.clone(), cancel_token.clone())
        .await
        .context("Failed to bind server")?;
    let addr = server.local_addr().context("Failed to read bound address")?;
    write_number(&port_file_path(), addr.port())?;

    let started = router.auto_start().await;
    info!(started, "Auto-start probes connected");

    if let Some(gateway) = gateway {
        router.set_gateway(&gateway.host, gateway.port);
    }

    server.run().await;

    log_summary(&router).await;
    router.shutdown().await;

    info!("probemon daemon stopped");
    Ok(())
}

async fn log_summary(router: &Router) {
    for conn in router.connections() {
        let summary = conn.summary();
        info!(
            connection = summary.id,
            state = %summary.state,
            peer = ?summary.remote.as_ref().map(|r| format!("{}/{}", r.host_name, r.app_name)),
            connected_at = ?summary.connected_at,
            incoming = summary.incoming_probes,
            "Connection at shutdown"
        );
    }
    for probe in router.running_probes().await {
        info!(
            probe_id = %probe.id,
            key = %probe.key,
            class = %probe.class,
            refs = probe.ref_count,
            "Probe at shutdown"
        );
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
