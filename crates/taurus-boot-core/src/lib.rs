//! Bootstrap stages for the Taurus container entrypoint.
//!
//! The bootstrap is a one-time sequence run at container start:
//!
//! 1. [`config`] — snapshot and validate the environment;
//! 2. [`cert`] — provision (or reuse) the TLS bundle for the proxy;
//! 3. [`probe`] — wait for the backing services to become reachable;
//! 4. [`reset`] — optionally obliterate and recreate persisted state;
//! 5. [`supervisor`] — launch and supervise the long-running processes.
//!
//! Stages run strictly sequentially; each consumes the previous stage's
//! validated output and the first failure aborts the sequence with a
//! distinct exit code (see [`BootstrapError::exit_code`]).

pub mod cert;
pub mod config;
pub mod probe;
pub mod reset;
pub mod supervisor;

use std::path::PathBuf;

use tracing::info;

use crate::cert::{CertificateBundle, ProvisionError};
use crate::config::{Config, ConfigError};
use crate::probe::{ProbeError, ProbeOptions, ReadinessReport};
use crate::reset::{ResetError, ResetOutcome, StateStore};
use crate::supervisor::LaunchError;

/// Exit codes, one per bootstrap stage, plus the supervision failure.
pub mod exit_code {
    /// Configuration missing or invalid.
    pub const CONFIG: i32 = 10;
    /// Certificate provisioning failed.
    pub const PROVISION: i32 = 11;
    /// A backing service never became ready.
    pub const DEPENDENCY_TIMEOUT: i32 = 12;
    /// The destructive state reset failed.
    pub const RESET: i32 = 13;
    /// A child process failed to start.
    pub const LAUNCH: i32 = 14;
    /// A child process exited unexpectedly under supervision.
    pub const CHILD_EXITED: i32 = 15;
}

/// Any stage failure, tagged with its exit code.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Stage 1 failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stage 2 failure.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Stage 3 failure.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Stage 4 failure.
    #[error(transparent)]
    Reset(#[from] ResetError),

    /// Stage 5 failure (start).
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Stage 5 failure (supervision): a child exited unexpectedly.
    #[error("process '{name}' exited unexpectedly (code {code:?})")]
    ChildExited {
        /// Name of the child that exited first.
        name: String,
        /// Its exit code, when reported.
        code: Option<i32>,
    },
}

impl BootstrapError {
    /// The process exit code for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => exit_code::CONFIG,
            Self::Provision(_) => exit_code::PROVISION,
            Self::Probe(_) => exit_code::DEPENDENCY_TIMEOUT,
            Self::Reset(_) => exit_code::RESET,
            Self::Launch(_) => exit_code::LAUNCH,
            Self::ChildExited { .. } => exit_code::CHILD_EXITED,
        }
    }
}

/// Options for the preparation stages (2–4).
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Directory holding the TLS bundle.
    pub cert_dir: PathBuf,
    /// Readiness probe timing.
    pub probe: ProbeOptions,
}

/// Validated output of the preparation stages, consumed by the launcher.
#[derive(Debug)]
pub struct Prepared {
    /// The provisioned TLS bundle.
    pub certificate: CertificateBundle,
    /// The final readiness report (every endpoint ready).
    pub readiness: ReadinessReport,
    /// What the reset stage did.
    pub reset: ResetOutcome,
}

/// Run stages 2–4 in order, short-circuiting on the first failure.
///
/// The caller provides the state store so the destructive reset remains
/// injectable; production passes a [`reset::MySqlStateStore`], which stays
/// unconnected unless the obliterate flag is set.
///
/// # Errors
///
/// Returns the first stage failure as a [`BootstrapError`]; no later stage
/// runs after a failure, so a dependency timeout leaves the persisted state
/// untouched and nothing launched.
pub async fn prepare(
    config: &Config,
    opts: &PrepareOptions,
    store: &dyn StateStore,
) -> Result<Prepared, BootstrapError> {
    let certificate = cert::ensure_certificate(&config.tls_subject, &opts.cert_dir)?;

    let endpoints = config.endpoints();
    let readiness = probe::wait_ready(&endpoints, &opts.probe).await?;

    let reset = reset::maybe_reset(config, store).await?;

    info!("Bootstrap preparation complete");
    Ok(Prepared {
        certificate,
        readiness,
        reset,
    })
}
