//! [`ControlPlane`] implemented by shelling out to kubectl.
//!
//! Every invocation is bounded by a timeout; a kubectl child that outlives
//! it is killed when its future is dropped.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{HarnessError, Result};
use crate::session::{CommandOutput, ControlPlane, DescribeTarget, PodInfo, PolicyStatus};

/// Policy kinds that carry no status subresource; existence means programmed.
const STATUSLESS_POLICY_KINDS: &[&str] = &["networkpolicy", "networkpolicies", "netpol"];

/// kubectl-backed control plane.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    context: Option<String>,
    command_timeout: Duration,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>, context: Option<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            context,
            command_timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.context {
            Some(context) => vec!["--context".to_string(), context.clone()],
            None => Vec::new(),
        }
    }

    fn render(&self, args: &[String]) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.base_args());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let command = self.render(args);
        debug!(target: "harness.kubectl", command = %command, "Running kubectl");

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(HarnessError::Command {
                    command,
                    message: format!("failed to spawn: {e}"),
                })
            }
            Err(_) => {
                return Err(HarnessError::Command {
                    command,
                    message: format!("timed out after {timeout:?}"),
                })
            }
        };

        Ok(CommandOutput {
            command,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and require a zero exit.
    async fn run_checked(&self, args: &[String]) -> Result<CommandOutput> {
        let output = self.run(args, self.command_timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(HarnessError::Command {
                command: output.command.clone(),
                message: output.combined_output(),
            })
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Arguments for reading every line a selector's pods logged since `since`.
///
/// With `-l`, kubectl keeps only the last 10 lines per container unless
/// `--tail` is given.
fn logs_args(namespace: &str, selector: &str, since: Duration) -> Vec<String> {
    // kubectl rejects --since below one second
    let since_arg = format!("--since={}s", since.as_secs().max(1));
    args(&[
        "logs",
        "-n",
        namespace,
        "-l",
        selector,
        "--all-containers=true",
        "--prefix=true",
        "--max-log-requests=20",
        "--tail=-1",
        since_arg.as_str(),
    ])
}

#[async_trait]
impl ControlPlane for Kubectl {
    async fn cluster_info(&self) -> Result<CommandOutput> {
        self.run(&args(&["cluster-info"]), self.command_timeout).await
    }

    async fn apply(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput> {
        let manifest = manifest.to_string_lossy().into_owned();
        self.run(
            &args(&["apply", "-n", namespace, "-f", manifest.as_str()]),
            self.command_timeout,
        )
        .await
    }

    async fn delete(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput> {
        let manifest = manifest.to_string_lossy().into_owned();
        self.run(
            &args(&[
                "delete",
                "-n",
                namespace,
                "-f",
                manifest.as_str(),
                "--ignore-not-found=true",
                "--wait=false",
            ]),
            self.command_timeout,
        )
        .await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let mut list_args = args(&["get", "pods", "-n", namespace, "-o", "json"]);
        if !selector.is_empty() {
            list_args.push("-l".to_string());
            list_args.push(selector.to_string());
        }
        let output = self.run_checked(&list_args).await?;
        parse_pod_list(&output.stdout)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut exec_args = args(&["exec", "-n", namespace, pod, "--"]);
        exec_args.extend(argv.iter().cloned());
        self.run(&exec_args, timeout).await
    }

    async fn policy_status(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<PolicyStatus> {
        let output = self
            .run(
                &args(&["get", kind, name, "-n", namespace, "-o", "json"]),
                self.command_timeout,
            )
            .await?;

        if !output.success() {
            let combined = output.combined_output();
            if combined.contains("NotFound") || combined.contains("not found") {
                return Ok(PolicyStatus::Absent);
            }
            return Err(HarnessError::Command {
                command: output.command,
                message: combined,
            });
        }

        let statusless = STATUSLESS_POLICY_KINDS.contains(&kind.to_ascii_lowercase().as_str());
        parse_policy_status(&output.stdout, statusless)
    }

    async fn logs(&self, namespace: &str, selector: &str, since: Duration) -> Result<String> {
        let output = self.run_checked(&logs_args(namespace, selector, since)).await?;
        Ok(output.stdout)
    }

    async fn describe(&self, target: DescribeTarget, namespace: &str) -> Result<CommandOutput> {
        let describe_args = match target {
            DescribeTarget::Nodes => args(&["describe", "nodes"]),
            DescribeTarget::Pods => args(&["describe", "pods", "-n", namespace]),
        };
        self.run(&describe_args, self.command_timeout).await
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatusJson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    name: String,
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusJson {
    #[serde(default)]
    phase: String,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Decode `kubectl get pods -o json`.
pub(crate) fn parse_pod_list(json: &str) -> Result<Vec<PodInfo>> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let ready = item
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True");
            let ip = item
                .status
                .pod_ip
                .as_deref()
                .and_then(|raw| raw.parse::<IpAddr>().ok());
            PodInfo {
                name: item.metadata.name,
                ip,
                phase: item.status.phase,
                ready,
                terminating: item.metadata.deletion_timestamp.is_some(),
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct PolicyJson {
    #[serde(default)]
    status: Option<PolicyStatusJson>,
}

#[derive(Debug, Deserialize)]
struct PolicyStatusJson {
    #[serde(default)]
    nodes: std::collections::BTreeMap<String, NodePolicyStatus>,
}

#[derive(Debug, Deserialize)]
struct NodePolicyStatus {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    enforcing: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Decode a policy object's per-node programming status.
pub(crate) fn parse_policy_status(json: &str, statusless: bool) -> Result<PolicyStatus> {
    let policy: PolicyJson = serde_json::from_str(json)?;
    if statusless {
        return Ok(PolicyStatus::Programmed);
    }

    let nodes = policy.status.map(|s| s.nodes).unwrap_or_default();
    if nodes.is_empty() {
        return Ok(PolicyStatus::Pending {
            detail: "no node has reported status".to_string(),
        });
    }

    let lagging: Vec<String> = nodes
        .iter()
        .filter(|(_, status)| !(status.ok && status.enforcing))
        .map(|(node, status)| match status.error.as_deref() {
            Some(error) if !error.is_empty() => format!("{node} ({error})"),
            _ => node.clone(),
        })
        .collect();

    if lagging.is_empty() {
        Ok(PolicyStatus::Programmed)
    } else {
        Ok(PolicyStatus::Pending {
            detail: format!(
                "{}/{} nodes not enforcing: {}",
                lagging.len(),
                nodes.len(),
                lagging.join(", ")
            ),
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    const PODS_JSON: &str = r#"{
        "items": [
            {
                "metadata": {"name": "iperf3-server-7d9f"},
                "status": {
                    "phase": "Running",
                    "podIP": "10.0.1.17",
                    "conditions": [
                        {"type": "Initialized", "status": "True"},
                        {"type": "Ready", "status": "True"}
                    ]
                }
            },
            {
                "metadata": {"name": "iperf3-client-2c4b", "deletionTimestamp": "2026-10-19T10:00:00Z"},
                "status": {
                    "phase": "Running",
                    "podIP": "fd00::12",
                    "conditions": [{"type": "Ready", "status": "False"}]
                }
            },
            {
                "metadata": {"name": "iperf3-client-pending"},
                "status": {"phase": "Pending"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_pod_list() {
        let pods = parse_pod_list(PODS_JSON).unwrap();
        assert_eq!(pods.len(), 3);

        assert_eq!(pods[0].name, "iperf3-server-7d9f");
        assert_eq!(pods[0].ip, Some("10.0.1.17".parse().unwrap()));
        assert!(pods[0].is_running_and_ready());

        assert_eq!(pods[1].ip, Some("fd00::12".parse().unwrap()));
        assert!(pods[1].terminating);
        assert!(!pods[1].ready);

        assert_eq!(pods[2].ip, None);
        assert_eq!(pods[2].phase, "Pending");
    }

    #[test]
    fn test_parse_pod_list_rejects_garbage() {
        let err = parse_pod_list("error: You must be logged in").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_policy_programmed_on_every_node() {
        let json = r#"{"status": {"nodes": {
            "kind-worker": {"ok": true, "enforcing": true},
            "kind-worker2": {"ok": true, "enforcing": true}
        }}}"#;
        assert_eq!(
            parse_policy_status(json, false).unwrap(),
            PolicyStatus::Programmed
        );
    }

    #[test]
    fn test_policy_pending_names_lagging_nodes() {
        let json = r#"{"status": {"nodes": {
            "kind-worker": {"ok": true, "enforcing": true},
            "kind-worker2": {"ok": false, "enforcing": false, "error": "regeneration failed"}
        }}}"#;
        match parse_policy_status(json, false).unwrap() {
            PolicyStatus::Pending { detail } => {
                assert!(detail.starts_with("1/2 nodes"));
                assert!(detail.contains("kind-worker2 (regeneration failed)"));
            }
            other => panic!("expected Pending, got {other:?}"),
        }
    }

    #[test]
    fn test_policy_without_status_is_pending() {
        assert!(matches!(
            parse_policy_status(r#"{"metadata": {"name": "sctp-deny"}}"#, false).unwrap(),
            PolicyStatus::Pending { .. }
        ));
    }

    #[test]
    fn test_statusless_kind_is_programmed_once_present() {
        assert_eq!(
            parse_policy_status(r#"{"metadata": {"name": "deny-all"}}"#, true).unwrap(),
            PolicyStatus::Programmed
        );
    }

    #[tokio::test]
    async fn test_logs_read_whole_window() {
        // echo stands in for kubectl and prints the argv it was given
        let kubectl = Kubectl::new("echo", None, Duration::from_secs(5));

        let argv = kubectl
            .logs("kube-system", "k8s-app=cilium", Duration::from_secs(300))
            .await
            .unwrap();

        let argv: Vec<&str> = argv.split_whitespace().collect();
        assert!(argv.contains(&"--tail=-1"), "{argv:?}");
        assert!(argv.contains(&"--since=300s"), "{argv:?}");
        assert!(argv.contains(&"--prefix=true"), "{argv:?}");
    }

    #[test]
    fn test_logs_since_is_at_least_one_second() {
        let argv = logs_args("kube-system", "k8s-app=cilium", Duration::from_millis(200));
        assert!(argv.contains(&"--since=1s".to_string()));
    }

    #[test]
    fn test_render_includes_context() {
        let kubectl = Kubectl::new(
            "kubectl",
            Some("kind-policy".to_string()),
            Duration::from_secs(60),
        );
        assert_eq!(
            kubectl.render(&args(&["get", "pods"])),
            "kubectl --context kind-policy get pods"
        );
    }
}
