//! Connectivity probes.
//!
//! A probe runs the traffic generator inside a source pod against a
//! destination endpoint, wrapped in `timeout` so it can never outlive its
//! budget:
//!
//! ```text
//! timeout 5 iperf3 -i 1 -t 3 --sctp -c <destination>
//! ```
//!
//! The result is classified as `Allowed`, `Blocked` or `Error`. `Error` is
//! reserved for failures of the tooling itself (missing binary, bad flags,
//! exec transport, missing kernel support) so that broken infrastructure is
//! never scored as a policy verdict.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::errors::{HarnessError, Result};
use crate::manifest::Workload;
use crate::session::{ClusterSession, CommandOutput};

/// Exit status of coreutils `timeout` when the wrapped command ran out of time.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit statuses a shell uses for "found but not executable" / "not found".
const NOT_EXECUTABLE_EXIT_CODES: &[i32] = &[126, 127];

/// Output fragments that mean the probe tooling, not the policy, failed.
const TOOL_FAILURE_MARKERS: &[&str] = &[
    "executable file not found",
    "command not found",
    "unrecognized option",
    "parameter error",
    "Usage: iperf",
    "OCI runtime exec failed",
    "unable to upgrade connection",
    "container not found",
    "Protocol not supported",
    "Name or service not known",
    "unable to resolve host",
];

/// Output fragments that mean the connection was refused or never completed.
const BLOCKED_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "unable to connect to server",
    "control socket has closed unexpectedly",
];

/// Transport protocol exercised by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sctp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Sctp => "sctp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// iperf3 flag selecting the protocol; TCP is the default and needs none.
    pub fn iperf3_flag(self) -> Option<&'static str> {
        match self {
            Protocol::Sctp => Some("--sctp"),
            Protocol::Tcp => None,
            Protocol::Udp => Some("-u"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sctp" => Ok(Protocol::Sctp),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("unknown protocol {s}; expected sctp, tcp or udp")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic generator invocation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Traffic generator binary inside the client image.
    pub binary: String,
    /// Hard limit enforced by the in-pod `timeout` wrapper.
    pub budget: Duration,
    /// Length of the traffic run (`-t`).
    pub duration: Duration,
    /// Reporting interval (`-i`).
    pub report_interval: Duration,
    /// Worst-case connection establishment time of the transport.
    pub connect_ceiling: Duration,
    /// Extra time granted to `kubectl exec` on top of the budget.
    pub exec_slack: Duration,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            binary: "iperf3".to_string(),
            budget: Duration::from_secs(5),
            duration: Duration::from_secs(3),
            report_interval: Duration::from_secs(1),
            connect_ceiling: Duration::from_secs(1),
            exec_slack: Duration::from_secs(15),
        }
    }
}

impl ProbeSpec {
    /// The budget must cover the whole transfer plus connection setup, or
    /// plain latency would read as BLOCKED.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.duration.is_zero() {
            return Err("probe duration must be greater than zero".to_string());
        }
        let floor = self.duration + self.connect_ceiling;
        if self.budget <= floor {
            return Err(format!(
                "probe budget {:?} must exceed duration {:?} plus connect ceiling {:?}",
                self.budget, self.duration, self.connect_ceiling
            ));
        }
        Ok(())
    }

    /// argv executed inside the source pod.
    pub fn command(&self, protocol: Protocol, destination: &EndpointRef) -> Vec<String> {
        let mut argv = vec![
            "timeout".to_string(),
            self.budget.as_secs().max(1).to_string(),
            self.binary.clone(),
            "-i".to_string(),
            self.report_interval.as_secs().max(1).to_string(),
            "-t".to_string(),
            self.duration.as_secs().max(1).to_string(),
        ];
        if let Some(flag) = protocol.iperf3_flag() {
            argv.push(flag.to_string());
        }
        argv.push("-c".to_string());
        argv.push(destination.to_string());
        argv
    }

    /// Wall-clock limit for the whole exec round trip.
    pub fn exec_timeout(&self) -> Duration {
        self.budget + self.exec_slack
    }
}

/// A traffic destination, resolved at use time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndpointRef {
    /// Address of a specific pod; not stable across redeploys.
    PodIp(IpAddr),
    /// Cluster-routable service name.
    Service(String),
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::PodIp(ip) => write!(f, "{ip}"),
            EndpointRef::Service(name) => f.write_str(name),
        }
    }
}

/// The two traffic paths every regime is assessed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrafficPath {
    PodToPod,
    PodToService,
}

impl TrafficPath {
    pub const ALL: [TrafficPath; 2] = [TrafficPath::PodToPod, TrafficPath::PodToService];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficPath::PodToPod => "pod-to-pod",
            TrafficPath::PodToService => "pod-to-service",
        }
    }
}

impl fmt::Display for TrafficPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Allowed,
    Blocked,
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Allowed => "ALLOWED",
            Outcome::Blocked => "BLOCKED",
            Outcome::Error => "ERROR",
        })
    }
}

/// Classify a finished probe command.
pub fn classify(output: &CommandOutput) -> Outcome {
    let Some(code) = output.exit_code else {
        return Outcome::Error;
    };
    if code == 0 {
        return Outcome::Allowed;
    }

    let combined = output.combined_output();
    if NOT_EXECUTABLE_EXIT_CODES.contains(&code)
        || TOOL_FAILURE_MARKERS.iter().any(|m| combined.contains(m))
    {
        return Outcome::Error;
    }
    if code == TIMEOUT_EXIT_CODE || BLOCKED_MARKERS.iter().any(|m| combined.contains(m)) {
        return Outcome::Blocked;
    }
    Outcome::Error
}

/// Why a probe could not yield a policy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndeterminateReason {
    /// The traffic generator or exec transport failed.
    ToolFailure,
    /// The pre-transition outcome was observed before the enforcement layer
    /// could reasonably have converged.
    ConvergenceLag,
}

impl fmt::Display for IndeterminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndeterminateReason::ToolFailure => "probe tooling failed",
            IndeterminateReason::ConvergenceLag => "enforcement had not converged",
        })
    }
}

/// Judgement of one probe against its expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "assessment", content = "reason")]
pub enum Assessment {
    Passed,
    Mismatch,
    Indeterminate(IndeterminateReason),
}

/// The grace period that follows a policy acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceWindow {
    /// What the previous regime expected on this path.
    pub prior_outcome: Outcome,
    pub acknowledged_at: Instant,
    /// One confirmation-poll interval.
    pub grace: Duration,
}

impl ConvergenceWindow {
    pub fn closes_at(&self) -> Instant {
        self.acknowledged_at + self.grace
    }

    /// A probe started exactly at `closes_at` is outside the window.
    pub fn contains(&self, at: Instant) -> bool {
        at < self.closes_at()
    }
}

/// Compare an observed outcome with the expected one.
pub fn assess(
    expected: Outcome,
    observed: Outcome,
    started: Instant,
    window: Option<&ConvergenceWindow>,
) -> Assessment {
    if observed == Outcome::Error {
        return Assessment::Indeterminate(IndeterminateReason::ToolFailure);
    }
    if observed == expected {
        return Assessment::Passed;
    }
    match window {
        Some(w) if observed == w.prior_outcome && w.contains(started) => {
            Assessment::Indeterminate(IndeterminateReason::ConvergenceLag)
        }
        _ => Assessment::Mismatch,
    }
}

/// Everything captured from one probe execution.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeEvidence {
    pub path: TrafficPath,
    pub source_pod: String,
    pub destination: EndpointRef,
    pub protocol: Protocol,
    pub outcome: Outcome,
    /// Command and combined output, when the exec completed.
    pub output: Option<CommandOutput>,
    /// Failure to run the exec at all.
    pub error: Option<String>,
    pub started_wall: DateTime<Utc>,
    #[serde(skip)]
    pub started: Instant,
    pub elapsed: Duration,
}

/// One probe to run within a regime.
#[derive(Debug, Clone)]
pub struct ProbeRequest<'w> {
    pub path: TrafficPath,
    pub source: &'w Workload,
    pub destination: EndpointRef,
}

/// Runs probes from inside source pods.
#[derive(Debug, Clone)]
pub struct ProbeExecutor<'a> {
    session: &'a ClusterSession,
    spec: ProbeSpec,
    protocol: Protocol,
    permits: Arc<Semaphore>,
}

impl<'a> ProbeExecutor<'a> {
    pub fn new(
        session: &'a ClusterSession,
        spec: ProbeSpec,
        protocol: Protocol,
        concurrency: usize,
    ) -> Self {
        Self {
            session,
            spec,
            protocol,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    /// Resolve the destination for `path` against the ready server workload.
    ///
    /// Pod addresses are looked up on every call and never cached.
    pub async fn resolve_destination(
        &self,
        path: TrafficPath,
        server: &Workload,
        service_name: &str,
    ) -> Result<EndpointRef> {
        server.ensure_ready()?;
        match path {
            TrafficPath::PodToService => Ok(EndpointRef::Service(service_name.to_string())),
            TrafficPath::PodToPod => {
                let pods = self
                    .session
                    .pods_by_label(server.namespace(), server.selector())
                    .await?;
                pods.into_iter()
                    .next()
                    .map(|(_, ip)| EndpointRef::PodIp(ip))
                    .ok_or_else(|| HarnessError::Indeterminate {
                        path: path.to_string(),
                        reason: format!("no ready pod with an address for {}", server.selector()),
                    })
            }
        }
    }

    /// Run one probe from `source` to `destination`.
    ///
    /// Returns `NotReady` without executing anything if `source` has not
    /// passed its readiness wait. Exec transport failures are folded into
    /// evidence with an `Error` outcome.
    #[instrument(skip_all, name = "harness.probe", fields(path = %path, destination = %destination))]
    pub async fn probe(
        &self,
        path: TrafficPath,
        source: &Workload,
        destination: &EndpointRef,
    ) -> Result<ProbeEvidence> {
        source.ensure_ready()?;
        let control_plane = self.session.control_plane()?;

        let source_pod = control_plane
            .list_pods(source.namespace(), source.selector())
            .await?
            .into_iter()
            .find(|p| p.is_running_and_ready())
            .map(|p| p.name)
            .ok_or_else(|| HarnessError::Indeterminate {
                path: path.to_string(),
                reason: format!("no ready source pod for {}", source.selector()),
            })?;

        let argv = self.spec.command(self.protocol, destination);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HarnessError::Session("probe pool closed".to_string()))?;

        let started = Instant::now();
        let started_wall = Utc::now();
        debug!(target: "harness.probe", pod = %source_pod, argv = ?argv, "Executing probe");

        let exec = control_plane
            .exec(source.namespace(), &source_pod, &argv, self.spec.exec_timeout())
            .await;

        let (outcome, output, error) = match exec {
            Ok(output) => (classify(&output), Some(output), None),
            Err(e) => (Outcome::Error, None, Some(e.to_string())),
        };

        info!(
            target: "harness.probe",
            path = %path,
            pod = %source_pod,
            destination = %destination,
            outcome = %outcome,
            "Probe finished"
        );

        Ok(ProbeEvidence {
            path,
            source_pod,
            destination: destination.clone(),
            protocol: self.protocol,
            outcome,
            output,
            error,
            started_wall,
            started,
            elapsed: started.elapsed(),
        })
    }

    /// Run independent probes concurrently, bounded by the executor's pool.
    ///
    /// Results are returned in request order.
    pub async fn probe_all(&self, requests: &[ProbeRequest<'_>]) -> Vec<Result<ProbeEvidence>> {
        join_all(
            requests
                .iter()
                .map(|req| self.probe(req.path, req.source, &req.destination)),
        )
        .await
    }
}
