//! Dependency readiness probing.
//!
//! Each backing service gets its own polling loop: a slow database never
//! blocks probing the broker. The loops share one deadline, so the stage
//! completes within the configured budget even when an endpoint never
//! becomes reachable.
//!
//! A probe is a plain TCP connect. That is deliberately shallow — the goal
//! is to not race service startup, not to validate credentials; the
//! application performs its own authenticated handshakes once launched.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// Which backing service an endpoint belongs to.
///
/// The ordering is the dependency order of the stack; it also breaks ties
/// when several endpoints exceed the probe budget, so the reported failure
/// is stable under permutation of the endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ServiceKind {
    /// Relational store (MySQL).
    Database,
    /// Message broker (RabbitMQ).
    Broker,
    /// Key-value store (DynamoDB local endpoint).
    KeyValue,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Database => "database",
            Self::Broker => "broker",
            Self::KeyValue => "key-value store",
        };
        f.write_str(name)
    }
}

/// One backing-service endpoint: host, port and the credential identity the
/// application will use. Immutable after derivation from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    /// Service classification.
    pub kind: ServiceKind,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User the application connects as, when the service has one.
    pub user: Option<String>,
}

impl ServiceEndpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.kind, self.host, self.port)
    }
}

/// Probe outcome for a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeStatus {
    /// Not yet attempted (only observable mid-probe).
    Pending,
    /// Accepted a TCP connection.
    Ready,
    /// Exceeded the probe budget without connecting.
    Failed,
}

/// Per-endpoint readiness record. Owned by the prober and discarded with
/// the [`ReadinessReport`] once the next stage begins.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessRecord {
    /// The probed endpoint.
    pub endpoint: ServiceEndpoint,
    /// Final status.
    pub status: ProbeStatus,
    /// Connect attempts made.
    pub attempts: u32,
    /// Last connection error observed, if any.
    pub last_error: Option<String>,
    /// When the endpoint became ready.
    pub ready_at: Option<DateTime<Utc>>,
}

/// Aggregate report: one record per probed endpoint.
#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    /// Records in the order the endpoints were supplied.
    pub records: Vec<ReadinessRecord>,
}

impl ReadinessReport {
    /// Whether every endpoint reported ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.status == ProbeStatus::Ready)
    }
}

/// Probe timing parameters.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Delay between connect attempts on one endpoint.
    pub interval: Duration,
    /// Budget for a single connect attempt.
    pub connect_timeout: Duration,
    /// Shared budget for the whole readiness stage.
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(3),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Readiness-stage failure.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// An endpoint exceeded the shared probe budget.
    #[error(
        "dependency not ready: {endpoint} after {attempts} attempt(s) ({last_error})"
    )]
    DependencyTimeout {
        /// The endpoint that exceeded the budget.
        endpoint: ServiceEndpoint,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last connection error observed.
        last_error: String,
    },
}

/// Probe every endpoint concurrently until all are ready or the shared
/// budget elapses.
///
/// # Errors
///
/// Returns [`ProbeError::DependencyTimeout`] identifying the first endpoint
/// (in dependency order) that failed to become ready; the remaining
/// endpoints' outcomes are logged but not reported.
pub async fn wait_ready(
    endpoints: &[ServiceEndpoint],
    opts: &ProbeOptions,
) -> Result<ReadinessReport, ProbeError> {
    if endpoints.is_empty() {
        return Ok(ReadinessReport { records: vec![] });
    }

    let deadline = Instant::now() + opts.timeout;
    info!(
        endpoints = endpoints.len(),
        timeout = ?opts.timeout,
        "Waiting for backing services"
    );

    let probes = endpoints.iter().map(|ep| probe_endpoint(ep, opts, deadline));
    let records = futures::future::join_all(probes).await;

    // Deterministic first-failure identification: all failing endpoints hit
    // the same shared deadline, so the tie is broken by dependency order
    // rather than input order.
    if let Some(failed) = records
        .iter()
        .filter(|r| r.status == ProbeStatus::Failed)
        .min_by_key(|r| r.endpoint.kind)
    {
        return Err(ProbeError::DependencyTimeout {
            endpoint: failed.endpoint.clone(),
            attempts: failed.attempts,
            last_error: failed
                .last_error
                .clone()
                .unwrap_or_else(|| "no connection attempt completed".to_string()),
        });
    }

    info!("All backing services ready");
    Ok(ReadinessReport { records })
}

/// Poll a single endpoint until it connects or the shared deadline passes.
async fn probe_endpoint(
    endpoint: &ServiceEndpoint,
    opts: &ProbeOptions,
    deadline: Instant,
) -> ReadinessRecord {
    let addr = endpoint.addr();
    let mut attempts: u32 = 0;
    let mut last_error: Option<String> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(endpoint = %endpoint, attempts, "Probe budget exhausted");
            return ReadinessRecord {
                endpoint: endpoint.clone(),
                status: ProbeStatus::Failed,
                attempts,
                last_error,
                ready_at: None,
            };
        }

        attempts += 1;
        let connect_budget = opts.connect_timeout.min(remaining);
        match timeout(connect_budget, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                info!(endpoint = %endpoint, attempts, "Backing service ready");
                return ReadinessRecord {
                    endpoint: endpoint.clone(),
                    status: ProbeStatus::Ready,
                    attempts,
                    last_error,
                    ready_at: Some(Utc::now()),
                };
            },
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, attempts, error = %e, "Probe attempt failed");
                last_error = Some(e.to_string());
            },
            Err(_) => {
                debug!(endpoint = %endpoint, attempts, "Probe attempt timed out");
                last_error = Some(format!("connect timed out after {connect_budget:?}"));
            },
        }

        // Don't start a sleep that cannot end before the deadline.
        if Instant::now() + opts.interval >= deadline {
            warn!(endpoint = %endpoint, attempts, "Probe budget exhausted");
            return ReadinessRecord {
                endpoint: endpoint.clone(),
                status: ProbeStatus::Failed,
                attempts,
                last_error,
                ready_at: None,
            };
        }
        sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn endpoint(kind: ServiceKind, port: u16) -> ServiceEndpoint {
        ServiceEndpoint {
            kind,
            host: "127.0.0.1".to_string(),
            port,
            user: None,
        }
    }

    fn fast_opts() -> ProbeOptions {
        ProbeOptions {
            interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(250),
            timeout: Duration::from_millis(500),
        }
    }

    /// Bind and immediately drop a listener to obtain a port that refuses
    /// connections.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn reports_ready_when_endpoint_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoints = vec![endpoint(ServiceKind::Database, port)];

        let report = wait_ready(&endpoints, &fast_opts()).await.unwrap();
        assert!(report.all_ready());
        assert_eq!(report.records[0].attempts, 1);
        assert!(report.records[0].ready_at.is_some());
    }

    #[tokio::test]
    async fn waits_for_a_late_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Rebind the same port after a couple of probe intervals.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let relisten = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            // Hold the listener until the test is done probing.
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(relisten);
        });

        let endpoints = vec![endpoint(ServiceKind::Broker, port)];
        let opts = ProbeOptions {
            timeout: Duration::from_secs(5),
            ..fast_opts()
        };
        let report = wait_ready(&endpoints, &opts).await.unwrap();
        assert!(report.all_ready());
        assert!(report.records[0].attempts >= 2);
    }

    #[tokio::test]
    async fn terminates_within_budget_and_names_the_endpoint() {
        let port = closed_port().await;
        let endpoints = vec![endpoint(ServiceKind::Database, port)];
        let opts = fast_opts();

        let start = std::time::Instant::now();
        let err = wait_ready(&endpoints, &opts).await.unwrap_err();
        let elapsed = start.elapsed();

        // Budget plus a generous epsilon for scheduling.
        assert!(
            elapsed < opts.timeout + Duration::from_secs(2),
            "probe took {elapsed:?}"
        );
        let ProbeError::DependencyTimeout {
            endpoint: failed, ..
        } = err;
        assert_eq!(failed.kind, ServiceKind::Database);
        assert_eq!(failed.port, port);
    }

    #[tokio::test]
    async fn failure_identification_is_order_independent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ready_port = listener.local_addr().unwrap().port();
        let dead_port = closed_port().await;

        let ready = endpoint(ServiceKind::Database, ready_port);
        let dead = endpoint(ServiceKind::Broker, dead_port);

        for order in [vec![ready.clone(), dead.clone()], vec![dead, ready]] {
            let err = wait_ready(&order, &fast_opts()).await.unwrap_err();
            let ProbeError::DependencyTimeout {
                endpoint: failed, ..
            } = err;
            assert_eq!(failed.kind, ServiceKind::Broker);
            assert_eq!(failed.port, dead_port);
        }
    }

    #[tokio::test]
    async fn slowest_failure_is_broken_by_dependency_order() {
        // Two dead endpoints: the database must win the tie regardless of
        // position in the input.
        let a = closed_port().await;
        let b = closed_port().await;
        let endpoints = vec![
            endpoint(ServiceKind::KeyValue, a),
            endpoint(ServiceKind::Database, b),
        ];

        let err = wait_ready(&endpoints, &fast_opts()).await.unwrap_err();
        let ProbeError::DependencyTimeout {
            endpoint: failed, ..
        } = err;
        assert_eq!(failed.kind, ServiceKind::Database);
    }

    #[tokio::test]
    async fn empty_endpoint_list_is_trivially_ready() {
        let report = wait_ready(&[], &fast_opts()).await.unwrap();
        assert!(report.all_ready());
        assert!(report.records.is_empty());
    }
}
