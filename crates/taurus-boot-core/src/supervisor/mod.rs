//! Child process launch and supervision.
//!
//! The launcher starts the reverse proxy and the application processes in
//! dependency order, then supervises them as a single unit: the first
//! unexpected child exit, or an external shutdown request, moves the
//! supervisor from `Running` to `Stopping`. Stopping broadcasts SIGTERM to
//! every remaining child, waits up to a bounded grace period, and SIGKILLs
//! stragglers; `Stopped` is reached only once every child has been reaped.
//!
//! There is deliberately no restart logic here. Process identity is not
//! resumable mid-session, so a crashed sibling takes the whole stack down
//! and the container supervisor decides whether to start over.

mod spawn;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// How long to wait for SIGKILLed children to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Specification of one supervised child process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Human-readable process name, used in logs and errors.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Environment variables set for the child.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    /// Create a spec for `command` named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Append environment variables.
    #[must_use]
    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Launch-stage failure.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// A child failed to start. Children started before it have already
    /// been terminated when this is returned.
    #[error("failed to start process '{name}': {source}")]
    SpawnFailed {
        /// Process name from the spec.
        name: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The launch plan contained no processes.
    #[error("launch plan is empty")]
    EmptyPlan,

    /// Creating one of the mounted volume directories failed.
    #[error("failed to create volume directory {path}: {source}")]
    Volume {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// Registering the shutdown signal handlers failed. Supervising
    /// without them would orphan children on container stop, so this is
    /// fatal.
    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Children spawned, supervision not yet running.
    Starting,
    /// All children running under supervision.
    Running,
    /// Termination broadcast in progress.
    Stopping,
    /// Every child has been reaped.
    Stopped,
}

/// Why supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// A child exited without being asked to; its siblings were then
    /// terminated. The bootstrap exits non-zero.
    ChildExited {
        /// Name of the child that exited first.
        name: String,
        /// Its exit code, when the platform reports one.
        code: Option<i32>,
    },
    /// An external shutdown request arrived and all children were stopped
    /// in order. The bootstrap exits zero.
    Signalled,
}

/// Requests supervisor shutdown from outside (signal handlers, tests).
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request an orderly shutdown. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// One supervised child.
#[derive(Debug)]
struct ChildEntry {
    name: String,
    pid: u32,
    alive: bool,
}

/// Exit notification from a child's waiter task.
struct ChildEvent {
    index: usize,
    status: Option<ExitStatus>,
}

/// Supervises a set of launched child processes as a unit.
#[derive(Debug)]
pub struct Supervisor {
    children: Vec<ChildEntry>,
    events: mpsc::UnboundedReceiver<ChildEvent>,
    shutdown: ShutdownHandle,
    state: SupervisorState,
}

impl Supervisor {
    /// Spawn every process in the plan, in order.
    ///
    /// Must be called within a Tokio runtime: each child gets a waiter task
    /// that reaps it and reports its exit. On a spawn failure the children
    /// started so far are killed before the error is returned, so no
    /// partial stack is left behind.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::EmptyPlan`] for an empty plan and
    /// [`LaunchError::SpawnFailed`] naming the process that failed.
    pub fn launch(specs: Vec<ProcessSpec>) -> Result<Self, LaunchError> {
        if specs.is_empty() {
            return Err(LaunchError::EmptyPlan);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut children: Vec<ChildEntry> = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            match spawn::spawn(spec) {
                Ok(spawned) => {
                    info!(process = %spec.name, pid = spawned.pid, "Started process");
                    let tx = tx.clone();
                    let mut child = spawned.child;
                    tokio::spawn(async move {
                        let status = child.wait().await.ok();
                        let _ = tx.send(ChildEvent { index, status });
                    });
                    children.push(ChildEntry {
                        name: spec.name.clone(),
                        pid: spawned.pid,
                        alive: true,
                    });
                },
                Err(e) => {
                    warn!(process = %spec.name, error = %e, "Spawn failed; tearing down partial stack");
                    for child in &children {
                        deliver_signal(child.pid, Signal::SIGKILL);
                    }
                    return Err(e);
                },
            }
        }

        Ok(Self {
            children,
            events: rx,
            shutdown: ShutdownHandle::new(),
            state: SupervisorState::Starting,
        })
    }

    /// Handle used to request shutdown from signal handlers or tests.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Supervise until the first unexpected child exit or an external
    /// shutdown request, then stop every remaining child.
    ///
    /// Stopping broadcasts SIGTERM, waits up to `grace`, and SIGKILLs
    /// whatever is left; the method returns only once all children have
    /// been reaped (`Stopped`).
    pub async fn run(mut self, grace: Duration) -> SupervisorExit {
        self.state = SupervisorState::Running;
        info!(children = self.children.len(), "Supervisor running");

        enum Wake {
            Child(Option<ChildEvent>),
            Shutdown,
        }

        let wake = tokio::select! {
            event = self.events.recv() => Wake::Child(event),
            () = self.shutdown.notify.notified() => Wake::Shutdown,
        };

        let exit = match wake {
            Wake::Child(Some(ev)) => {
                let code = ev.status.and_then(|s| s.code());
                let entry = &mut self.children[ev.index];
                entry.alive = false;
                let name = entry.name.clone();
                warn!(process = %name, code, "Child exited unexpectedly; stopping siblings");
                SupervisorExit::ChildExited { name, code }
            },
            // All waiter senders gone without an event; nothing left to
            // supervise.
            Wake::Child(None) => SupervisorExit::Signalled,
            Wake::Shutdown => {
                info!("Shutdown requested; stopping all children");
                SupervisorExit::Signalled
            },
        };

        self.state = SupervisorState::Stopping;
        self.stop_remaining(grace).await;
        self.state = SupervisorState::Stopped;
        info!("Supervisor stopped");
        exit
    }

    /// Broadcast SIGTERM, wait out the grace period, SIGKILL stragglers,
    /// and reap everything.
    async fn stop_remaining(&mut self, grace: Duration) {
        if self.alive_count() == 0 {
            return;
        }

        for child in self.children.iter().filter(|c| c.alive) {
            debug!(process = %child.name, pid = child.pid, "Sending SIGTERM");
            deliver_signal(child.pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        self.reap_until(deadline).await;

        if self.alive_count() > 0 {
            for child in self.children.iter().filter(|c| c.alive) {
                warn!(
                    process = %child.name,
                    pid = child.pid,
                    "Child survived grace period; sending SIGKILL"
                );
                deliver_signal(child.pid, Signal::SIGKILL);
            }
            self.reap_until(Instant::now() + KILL_REAP_TIMEOUT).await;
        }

        if self.alive_count() > 0 {
            // Should not happen after SIGKILL; log and move on rather than
            // hanging the container exit.
            warn!(
                remaining = self.alive_count(),
                "Children unreaped after SIGKILL deadline"
            );
        }
    }

    /// Consume child-exit events until none remain alive or the deadline
    /// passes.
    async fn reap_until(&mut self, deadline: Instant) {
        while self.alive_count() > 0 {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(ev)) => {
                    let entry = &mut self.children[ev.index];
                    entry.alive = false;
                    debug!(
                        process = %entry.name,
                        code = ev.status.and_then(|s| s.code()),
                        "Child stopped"
                    );
                },
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    fn alive_count(&self) -> usize {
        self.children.iter().filter(|c| c.alive).count()
    }
}

/// Send a signal to a PID, logging delivery failures.
fn deliver_signal(pid: u32, signal: Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = kill(target, signal) {
        // ESRCH just means the child won the race and is already gone.
        debug!(pid, ?signal, error = %e, "Signal delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(name: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sleep").args(["30"])
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn child_exit_terminates_siblings() {
        let specs = vec![
            ProcessSpec::new("worker", "sh").args(["-c", "sleep 0.2; exit 7"]),
            sleeper("proxy"),
        ];
        let supervisor = Supervisor::launch(specs).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Starting);

        let start = std::time::Instant::now();
        let exit = supervisor.run(Duration::from_secs(5)).await;

        assert_eq!(
            exit,
            SupervisorExit::ChildExited {
                name: "worker".to_string(),
                code: Some(7),
            }
        );
        // The 30s sleeper must not hold up shutdown.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn shutdown_request_stops_all_children() {
        let supervisor = Supervisor::launch(vec![sleeper("a"), sleeper("b")]).unwrap();
        let handle = supervisor.shutdown_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.request();
        });

        let start = std::time::Instant::now();
        let exit = supervisor.run(Duration::from_secs(5)).await;

        assert_eq!(exit, SupervisorExit::Signalled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn shutdown_requested_before_run_is_not_lost() {
        let supervisor = Supervisor::launch(vec![sleeper("a")]).unwrap();
        let handle = supervisor.shutdown_handle();
        handle.request();
        assert!(handle.is_requested());

        let exit = supervisor.run(Duration::from_secs(5)).await;
        assert_eq!(exit, SupervisorExit::Signalled);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn sigterm_ignorer_is_force_killed_within_grace() {
        let specs = vec![
            ProcessSpec::new("stubborn", "sh").args(["-c", "trap '' TERM; sleep 30 & wait"]),
        ];
        let supervisor = Supervisor::launch(specs).unwrap();
        let handle = supervisor.shutdown_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request();
        });

        let start = std::time::Instant::now();
        let exit = supervisor.run(Duration::from_millis(500)).await;

        assert_eq!(exit, SupervisorExit::Signalled);
        // request delay + grace + kill reaping, with scheduling slack.
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn spawn_failure_names_the_process() {
        let specs = vec![sleeper("first"), ProcessSpec::new("ghost", "nonexistent_command_12345")];
        let err = Supervisor::launch(specs).unwrap_err();
        assert!(matches!(err, LaunchError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let err = Supervisor::launch(vec![]).unwrap_err();
        assert!(matches!(err, LaunchError::EmptyPlan));
    }
}
