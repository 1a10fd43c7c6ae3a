//! dpxd - DPDK telemetry agent
//!
//! Registers with every DPDK runtime instance found under the socket root,
//! polls their port statistics and serves them on a Prometheus endpoint.
//!
//! # Usage
//!
//! ```bash
//! # Start the agent (foreground)
//! dpxd start
//!
//! # Start the agent (background/daemonized)
//! dpxd start -d
//!
//! # Poll specific instances instead of scanning the root
//! dpxd start --socket /var/run/dpdk/rte/telemetry
//!
//! # Use a config file and a different endpoint
//! dpxd start --config /etc/dpxd.toml --listen 127.0.0.1:9100
//!
//! # Stop the agent
//! dpxd stop
//!
//! # Check agent status
//! dpxd status
//!
//! # Enable debug logging
//! RUST_LOG=dpxd=debug dpxd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: graceful shutdown; every instance is sent Unregister
//!   and every callback socket is removed

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dpxd::config::AgentConfig;
use dpxd::exporter::{serve_metrics, PrometheusSink};
use dpxd::poller::Poller;

/// dpxd - DPDK telemetry agent and Prometheus exporter
#[derive(Parser, Debug)]
#[command(name = "dpxd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML configuration file (defaults to $DPX_CONFIG)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Advertiser socket to poll; repeat for several. Disables the root scan.
        #[arg(long = "socket", value_name = "PATH")]
        sockets: Vec<PathBuf>,

        /// Address of the /metrics endpoint
        #[arg(long, value_name = "ADDR")]
        listen: Option<SocketAddr>,
    },
    /// Stop the running agent
    Stop,
    /// Show agent status
    Status,
}

/// Returns the agent's state directory.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("dpx")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("dpxd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("dpxd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
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

/// Returns the PID of a running agent, clearing a stale PID file.
fn running_agent() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

/// Sends SIGTERM to the agent process.
fn stop_agent(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

/// Loads configuration and applies command-line overrides.
fn load_config(
    path: Option<PathBuf>,
    sockets: Vec<PathBuf>,
    listen: Option<SocketAddr>,
) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if !sockets.is_empty() {
        config.sockets = sockets;
    }
    if let Some(addr) = listen {
        config.metrics_addr = addr;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        sockets: Vec::new(),
        listen: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            sockets,
            listen,
        } => {
            if let Some(pid) = running_agent() {
                eprintln!("Agent is already running (PID {pid})");
                eprintln!("Use 'dpxd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal.
            let config = load_config(config, sockets, listen)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_agent(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = running_agent() else {
                println!("Agent is not running.");
                return Ok(());
            };

            println!("Stopping agent (PID {pid})...");
            stop_agent(pid)?;

            // Teardown notifies every instance, so allow a little longer.
            for _ in 0..100 {
                if !is_process_running(pid) {
                    println!("Agent stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            eprintln!("Agent did not stop within 10 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = running_agent() else {
                println!("Agent is not running.");
                process::exit(1);
            };

            println!("Agent is running (PID {pid})");
            if let Ok(config) = AgentConfig::load(None) {
                if config.sockets.is_empty() {
                    println!("Socket root: {}", config.socket_root.display());
                } else {
                    println!("Sockets: {}", config.sockets.len());
                }
                println!("Metrics: http://{}/metrics", config.metrics_addr);
            }
            Ok(())
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
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the agent (async entry point).
#[tokio::main]
async fn run_agent(config: AgentConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dpxd=info".parse()?)
                .add_directive("dpx_core=info".parse()?)
                .add_directive("dpx_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "dpxd starting"
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

    let sink = Arc::new(PrometheusSink::from_config(&config).context("Failed to create metrics sink")?);
    info!(node = sink.node_name(), "Metrics sink ready");

    let server_token = cancel_token.clone();
    let server_sink = sink.clone();
    let metrics_addr = config.metrics_addr;
    let server = tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_addr, server_sink, server_token.clone()).await {
            error!(error = %e, "Metrics endpoint failed");
            server_token.cancel();
        }
    });

    let poller = Poller::new(&config, sink, cancel_token.clone());
    let result = poller.run().await;

    cancel_token.cancel();
    let _ = server.await;

    if let Err(e) = result {
        error!(error = %e, "Poller stopped");
        return Err(e.into());
    }

    info!("dpxd stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}
