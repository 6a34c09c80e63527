//! Command-line entry point: `start`/`stop`/`status`/`reg_service`/`version`,
//! matching `original_source/lib/clup_agent.py::main`'s subcommand set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clup_agent::config::{self, Config};
use clup_agent::controller_client::ControllerClient;
use clup_agent::defaults::{DEFAULT_AGENT_RPC_PORT, DEFAULT_CONFIG_RELATIVE_PATH};
use clup_agent::register;
use clup_agent::rpc;
use clup_agent::shutdown::ShutdownGuard;

fn version() -> String {
    format!("clup-agent {}", env!("CARGO_PKG_VERSION"))
}

const ABOUT: &str = "Node-resident management agent for a PostgreSQL cluster-management controller.";

#[derive(Parser)]
#[command(name = "clup-agent", version = env!("CARGO_PKG_VERSION"), about = ABOUT, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level: debug, info, warn, error, critical.
    #[arg(short = 'l', long, global = true, default_value = "info")]
    loglevel: String,

    /// Path to clup-agent.conf; defaults to conf/clup-agent.conf next to the binary.
    #[arg(short = 'c', long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Output logs as JSON instead of plain text.
    #[arg(long, global = true)]
    log_format_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent.
    Start {
        /// Run in the foreground instead of daemonizing.
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop a running agent.
    Stop,
    /// Report whether the agent is running.
    Status,
    /// Register clup-agent as a system service.
    RegService,
    /// Print version information and exit.
    Version,
}

fn init_logging(loglevel: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(loglevel));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

fn default_config_path() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let bin_dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("executable has no parent directory"))?;
    let install_root = bin_dir.parent().unwrap_or(bin_dir);
    let path = install_root.join(DEFAULT_CONFIG_RELATIVE_PATH);
    Utf8PathBuf::from_path_buf(path).map_err(|p| anyhow::anyhow!("non-UTF8 config path {p:?}"))
}

/// Claims the PID file with `O_CREAT | O_EXCL`, refusing to start if another
/// agent already holds it and is still alive.
fn claim_pid_file() -> Result<PathBuf> {
    let path = config::pid_file_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
                anyhow::bail!("clup-agent already running with pid {pid}");
            }
        }
    }
    std::fs::write(&path, std::process::id().to_string()).context("write pid file")?;
    Ok(path)
}

fn read_pid_file() -> Result<i32> {
    let contents = std::fs::read_to_string(config::pid_file_path()).context("read pid file")?;
    contents
        .trim()
        .parse()
        .context("pid file does not contain a valid pid")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if matches!(args.command, Command::Version) {
        println!("{}", version());
        return Ok(());
    }

    init_logging(&args.loglevel, args.log_format_json)?;

    match args.command {
        Command::Start { foreground } => cmd_start(args.config, foreground).await,
        Command::Stop => cmd_stop(),
        Command::Status => cmd_status(),
        Command::RegService => cmd_reg_service().await,
        Command::Version => unreachable!("handled above"),
    }
}

async fn cmd_start(config_path: Option<Utf8PathBuf>, _foreground: bool) -> Result<()> {
    info!("{}", version());
    info!("========== clup-agent starting ==========");

    let path = match config_path {
        Some(p) => p,
        None => default_config_path()?,
    };
    let config = Arc::new(Config::load(&path).with_context(|| format!("load {path}"))?);

    let pid_path = claim_pid_file()?;
    let _pid_guard = PidFileGuard(pid_path);

    let controller = Arc::new(ControllerClient::new(config.clone()));
    register::run_registration_loop(config.clone(), &controller).await?;

    let shutdown = ShutdownGuard::new();
    let port = config
        .get_int("agent_rpc_port")
        .ok()
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_AGENT_RPC_PORT);
    let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();

    let server = rpc::server::new_server(config.clone(), controller.clone(), shutdown.clone());

    let rpc_shutdown = shutdown.clone();
    let rpc_handle = tokio::spawn(async move { rpc::server::run(server, addr, rpc_shutdown).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        res = rpc_handle => {
            if let Err(e) = res.context("rpc accept loop panicked")? {
                error!("rpc accept loop failed: {e:#}");
            }
        }
    }

    shutdown.set_exit();
    if shutdown.wait_for_drain().await {
        info!("========== clup-agent stopped ==========");
        Ok(())
    } else {
        info!("========== clup-agent force stopped ==========");
        std::process::exit(1);
    }
}

fn cmd_stop() -> Result<()> {
    let pid = read_pid_file()?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        .context("send SIGTERM")?;
    for _ in 0..10 {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
    warn!("clup-agent (pid {pid}) did not stop within 10s");
    Ok(())
}

fn cmd_status() -> Result<()> {
    match read_pid_file() {
        Ok(pid) if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() => {
            println!("clup-agent is running, pid={pid}");
            Ok(())
        }
        Ok(pid) => {
            println!("clup-agent is not running (stale pid file, pid={pid})");
            std::process::exit(1);
        }
        Err(_) => {
            println!("clup-agent is not running");
            std::process::exit(1);
        }
    }
}

const SYSTEMD_UNIT: &str = "\
[Unit]
Description=clup-agent
After=network.target

[Service]
Type=simple
ExecStart=/opt/clup-agent/bin/clup-agent start -f
Restart=on-failure

[Install]
WantedBy=multi-user.target
";

async fn cmd_reg_service() -> Result<()> {
    let unit_path = "/etc/systemd/system/clup-agent.service";
    std::fs::write(unit_path, SYSTEMD_UNIT).with_context(|| format!("write {unit_path}"))?;
    let result =
        clup_agent::osglue::run_cmd::run_cmd_result("systemctl daemon-reload && systemctl enable clup-agent").await;
    if result.ret_code != 0 {
        anyhow::bail!("systemctl enable failed: {}", result.stderr);
    }
    info!("registered clup-agent as a system service");
    Ok(())
}

/// Removes the PID file when dropped, so both the graceful and panic-unwind
/// paths release it.
struct PidFileGuard(PathBuf);

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
