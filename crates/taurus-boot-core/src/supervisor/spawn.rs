//! Child process spawning for the supervisor.

use std::process::Stdio;

use tokio::process::{Child, Command};

use super::{LaunchError, ProcessSpec};

/// A spawned child with its handle and PID.
#[derive(Debug)]
pub(crate) struct SpawnedProcess {
    /// The child process handle.
    pub child: Child,
    /// The OS process ID.
    pub pid: u32,
}

/// Spawn a child according to its specification.
///
/// Stdio is inherited so child output lands on the container's stdout and
/// stderr. `kill_on_drop` is off: termination is always explicit, driven by
/// the supervisor's signal protocol.
pub(crate) fn spawn(spec: &ProcessSpec) -> Result<SpawnedProcess, LaunchError> {
    let mut cmd = Command::new(&spec.command);

    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let child = cmd.spawn().map_err(|source| LaunchError::SpawnFailed {
        name: spec.name.clone(),
        source,
    })?;

    let pid = child.id().ok_or_else(|| LaunchError::SpawnFailed {
        name: spec.name.clone(),
        source: std::io::Error::other("failed to get process ID"),
    })?;

    Ok(SpawnedProcess { child, pid })
}
