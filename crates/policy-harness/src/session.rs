//! Cluster session and the control-plane seam.
//!
//! The harness never talks to the API server directly: every operation goes
//! through [`ControlPlane`], implemented over kubectl in production
//! ([`crate::kubectl::Kubectl`]) and in memory for tests
//! (`harness_test_utils::FakeCluster`).
//!
//! A [`ClusterSession`] is created once per suite, shared by reference with
//! every component, and closed once when the suite ends.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::errors::{HarnessError, Result};
use crate::eventual::{retry_until, RetryPolicy, WaitKind};

/// Maximum bytes of command output kept in evidence.
const MAX_EVIDENCE_LEN: usize = 16 * 1024;

/// Result of one control-plane command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Rendered command line, for the evidence trail.
    pub command: String,
    /// Exit status; `None` if the process was killed (e.g. timed out).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed to the evidence limit.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() && !self.stdout.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        truncate_evidence(combined)
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "`{}` exited {}", self.command, code)?,
            None => write!(f, "`{}` was killed", self.command)?,
        }
        let combined = self.combined_output();
        let trimmed = combined.trim();
        if !trimmed.is_empty() {
            write!(f, ": {trimmed}")?;
        }
        Ok(())
    }
}

fn truncate_evidence(mut text: String) -> String {
    if text.len() > MAX_EVIDENCE_LEN {
        let mut cut = MAX_EVIDENCE_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...[truncated]");
    }
    text
}

/// Pod as reported by `kubectl get pods -o json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodInfo {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub phase: String,
    /// All containers report ready.
    pub ready: bool,
    /// A deletion timestamp is set.
    pub terminating: bool,
}

impl PodInfo {
    pub fn is_running_and_ready(&self) -> bool {
        self.phase == "Running" && self.ready && !self.terminating
    }
}

/// Programming state of a policy object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PolicyStatus {
    /// No object with that name exists.
    Absent,
    /// Accepted by the API server, not yet enforced everywhere.
    Pending { detail: String },
    /// Every node reports the policy as enforced.
    Programmed,
}

/// Targets for diagnostic dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Nodes,
    Pods,
}

impl DescribeTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            DescribeTarget::Nodes => "nodes",
            DescribeTarget::Pods => "pods",
        }
    }
}

/// Operations the harness needs from the cluster control plane.
///
/// Non-zero exits are returned as `Ok(CommandOutput)` for the mutating and
/// exec calls so callers can classify them; `Err` means the command could
/// not be run at all (spawn failure, timeout, undecodable output).
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `kubectl cluster-info` equivalent; used to verify the session.
    async fn cluster_info(&self) -> Result<CommandOutput>;

    async fn apply(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput>;

    /// Delete everything in `manifest`; absent objects are not an error.
    async fn delete(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>>;

    /// Run `argv` inside the first container of `pod`.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn policy_status(&self, namespace: &str, kind: &str, name: &str)
        -> Result<PolicyStatus>;

    /// Logs of every pod matching `selector` since `since` ago, each line
    /// prefixed with `[pod/<name>/<container>]`.
    async fn logs(&self, namespace: &str, selector: &str, since: Duration) -> Result<String>;

    async fn describe(&self, target: DescribeTarget, namespace: &str) -> Result<CommandOutput>;
}

/// Process-wide cluster context.
///
/// Holds no cluster resources of its own. Mutating calls are serialized by
/// the scenario runner, so the underlying connection is shared without
/// locking.
#[derive(Clone)]
pub struct ClusterSession {
    context: Option<String>,
    namespace: String,
    assets_root: PathBuf,
    command_timeout: Duration,
    poll_interval: Duration,
    control_plane: Arc<dyn ControlPlane>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSession")
            .field("context", &self.context)
            .field("namespace", &self.namespace)
            .field("assets_root", &self.assets_root)
            .field("command_timeout", &self.command_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Parameters for [`ClusterSession::connect`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub context: Option<String>,
    pub namespace: String,
    pub assets_root: PathBuf,
    pub command_timeout: Duration,
    pub poll_interval: Duration,
}

impl ClusterSession {
    /// Open the suite-wide session and verify the control plane answers.
    #[instrument(skip_all, name = "harness.session.connect", fields(namespace = %options.namespace))]
    pub async fn connect(
        control_plane: Arc<dyn ControlPlane>,
        options: SessionOptions,
    ) -> Result<Self> {
        let info = control_plane.cluster_info().await?;
        if !info.success() {
            return Err(HarnessError::Session(format!(
                "control plane unreachable: {info}"
            )));
        }

        info!(
            target: "harness.session",
            context = options.context.as_deref().unwrap_or("<current>"),
            namespace = %options.namespace,
            "Cluster session established"
        );

        Ok(Self {
            context: options.context,
            namespace: options.namespace,
            assets_root: options.assets_root,
            command_timeout: options.command_timeout,
            poll_interval: options.poll_interval,
            control_plane,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Release the session at suite end. Further use returns `Session` errors.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(target: "harness.session", "Cluster session closed twice");
        } else {
            info!(target: "harness.session", "Cluster session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The control plane, provided the session is still open.
    pub fn control_plane(&self) -> Result<&dyn ControlPlane> {
        if self.is_closed() {
            return Err(HarnessError::Session("session is closed".to_string()));
        }
        Ok(self.control_plane.as_ref())
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resolve a manifest file name against the assets root.
    pub fn resolve_manifest(&self, file: &str) -> PathBuf {
        self.assets_root.join(file)
    }

    /// `(name, ip)` of every Running and Ready pod matching `selector` that
    /// has an address.
    pub async fn pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<(String, IpAddr)>> {
        let pods = self.control_plane()?.list_pods(namespace, selector).await?;
        Ok(pods
            .into_iter()
            .filter(PodInfo::is_running_and_ready)
            .filter_map(|pod| pod.ip.map(|ip| (pod.name, ip)))
            .collect())
    }

    /// Names of every pod matching `selector`.
    pub async fn pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let pods = self.control_plane()?.list_pods(namespace, selector).await?;
        Ok(pods.into_iter().map(|pod| pod.name).collect())
    }

    /// Wait until at least `expected` pods matching `selector` are Running and Ready.
    ///
    /// List failures during the wait are treated as transient and reported
    /// in the timeout observation.
    #[instrument(skip(self), name = "harness.session.wait_ready")]
    pub async fn wait_ready(
        &self,
        namespace: &str,
        selector: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<PodInfo>> {
        let control_plane = self.control_plane()?;
        let policy = RetryPolicy::new(self.poll_interval, timeout);

        retry_until(WaitKind::WorkloadReady, policy, move || async move {
            let pods = control_plane
                .list_pods(namespace, selector)
                .await
                .map_err(|e| format!("listing pods failed: {e}"))?;
            let ready: Vec<PodInfo> = pods
                .iter()
                .filter(|pod| pod.is_running_and_ready())
                .cloned()
                .collect();
            if ready.len() >= expected {
                Ok(ready)
            } else {
                Err(format!(
                    "{}/{} pods ready ({} listed)",
                    ready.len(),
                    expected,
                    pods.len()
                ))
            }
        })
        .await
        .map_err(|timeout| HarnessError::Timeout {
            what: format!("{} of {selector} in {namespace}", timeout.kind.as_str()),
            waited: timeout.waited,
            last_observation: timeout.last_observation,
        })
    }
}
