//! taurus-boot — container entrypoint for the Taurus stack.
//!
//! Invoked once at container start with no arguments. Runs the bootstrap
//! stages strictly in order — configuration, TLS provisioning, dependency
//! readiness, optional state reset — then launches and supervises the
//! reverse proxy and the application processes. Any stage failure aborts
//! with that stage's exit code; a clean externally-requested shutdown
//! exits zero.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use taurus_boot_core::cert::CertificateBundle;
use taurus_boot_core::config::Config;
use taurus_boot_core::probe::ProbeOptions;
use taurus_boot_core::reset::MySqlStateStore;
use taurus_boot_core::supervisor::{
    LaunchError, ProcessSpec, ShutdownHandle, Supervisor, SupervisorExit,
};
use taurus_boot_core::{BootstrapError, PrepareOptions, prepare};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Container bootstrap for the Taurus prediction stack.
#[derive(Parser, Debug)]
#[command(name = "taurus-boot")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the TLS key/certificate bundle
    #[arg(long, default_value = "/etc/taurus/ssl")]
    cert_dir: PathBuf,

    /// Externally mounted log volume, created if absent before launch
    #[arg(long, default_value = "/var/log/taurus")]
    log_volume: PathBuf,

    /// Externally mounted model-checkpoint volume, created if absent
    #[arg(long, default_value = "/var/lib/taurus/models")]
    model_volume: PathBuf,

    /// Delay between readiness probe attempts per endpoint
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    probe_interval: Duration,

    /// Budget for a single probe connect attempt
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    probe_connect_timeout: Duration,

    /// Overall readiness budget shared by all endpoints
    #[arg(long, default_value = "90s", value_parser = humantime::parse_duration)]
    probe_timeout: Duration,

    /// Grace period between SIGTERM and SIGKILL at shutdown
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_grace: Duration,

    /// Run every stage except the launch, then exit. Used as a deployment
    /// smoke check.
    #[arg(long)]
    skip_launch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(&args).await {
        error!(error = %e, exit_code = e.exit_code(), "Bootstrap failed");
        std::process::exit(e.exit_code());
    }
}

/// The staged bootstrap sequence.
async fn run(args: &Args) -> Result<(), BootstrapError> {
    let config = Config::from_process_env()?;
    info!(server_host = %config.server_host, "Configuration loaded");

    let opts = PrepareOptions {
        cert_dir: args.cert_dir.clone(),
        probe: ProbeOptions {
            interval: args.probe_interval,
            connect_timeout: args.probe_connect_timeout,
            timeout: args.probe_timeout,
        },
    };
    let store = MySqlStateStore::new(&config)?;
    let prepared = prepare(&config, &opts, &store).await?;

    if args.skip_launch {
        info!("--skip-launch set; bootstrap preparation succeeded");
        return Ok(());
    }

    ensure_volume(&args.log_volume)?;
    ensure_volume(&args.model_volume)?;

    let supervisor = Supervisor::launch(launch_plan(&config, &prepared.certificate))?;
    forward_signals(supervisor.shutdown_handle())?;

    match supervisor.run(args.shutdown_grace).await {
        SupervisorExit::Signalled => {
            info!("Clean shutdown complete");
            Ok(())
        },
        SupervisorExit::ChildExited { name, code } => {
            Err(BootstrapError::ChildExited { name, code })
        },
    }
}

/// Processes to launch, in dependency order: the TLS-terminating proxy
/// first, then the application's server and workers. Children receive the
/// validated configuration via environment.
fn launch_plan(config: &Config, certificate: &CertificateBundle) -> Vec<ProcessSpec> {
    let cert_env: Vec<(String, String)> = vec![
        (
            "TAURUS_TLS_KEY".to_string(),
            certificate.key_path.display().to_string(),
        ),
        (
            "TAURUS_TLS_CERT".to_string(),
            certificate.cert_path.display().to_string(),
        ),
    ];

    vec![
        ProcessSpec::new("nginx", "nginx")
            .args(["-g", "daemon off;"])
            .envs(cert_env),
        ProcessSpec::new("taurus-server", "taurus-server").envs(config.child_env()),
        ProcessSpec::new("taurus-workers", "taurus-workers").envs(config.child_env()),
    ]
}

/// Create an externally mounted volume directory if absent. The bootstrap
/// never writes into it afterwards; the directories belong to the
/// application processes.
fn ensure_volume(path: &std::path::Path) -> Result<(), BootstrapError> {
    std::fs::create_dir_all(path).map_err(|source| {
        BootstrapError::Launch(LaunchError::Volume {
            path: path.to_path_buf(),
            source,
        })
    })
}

/// Forward SIGTERM/SIGINT to the supervisor as a shutdown request.
fn forward_signals(handle: ShutdownHandle) -> Result<(), BootstrapError> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| BootstrapError::Launch(LaunchError::Signals(e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| BootstrapError::Launch(LaunchError::Signals(e)))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        handle.request();
    });
    Ok(())
}

/// Initialize tracing, to stdout or an append-mode log file.
fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}
