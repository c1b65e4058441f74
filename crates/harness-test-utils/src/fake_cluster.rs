//! In-memory control plane.
//!
//! `FakeCluster` models just enough of a cluster for the scenario runner:
//! manifests create pods or policies, policies take a configurable number
//! of acknowledgement polls to become programmed, and probes exec'd in a
//! client pod succeed or time out depending on which policies are enforced.
//!
//! A policy is acknowledged either through its object status or through the
//! agent pod, whose `<cli> policy get -o json` lists the imported rules and
//! whose `<cli> policy wait <revision>` succeeds once that revision exists.
//!
//! Faults are injected with `with_*` builders:
//!
//! ```rust,ignore
//! let cluster = FakeCluster::new()
//!     .with_rejected_apply("policy-allow-sctp.yaml")
//!     .with_stuck_termination();
//! ```
//!
//! Manifests are matched by file name, so any assets root works.

use async_trait::async_trait;
use policy_harness::errors::{HarnessError, Result};
use policy_harness::session::{CommandOutput, ControlPlane, DescribeTarget, PodInfo, PolicyStatus};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exit status of the in-pod `timeout` wrapper.
const TIMEOUT_EXIT: i32 = 124;

const IPERF3_SUCCESS: &str = "\
Connecting to host iperf3-server, port 5201
[  5] local 10.244.1.5 port 40412 connected to 10.244.2.7 port 5201
[ ID] Interval           Transfer     Bitrate
[  5]   0.00-3.00   sec   412 MBytes  1.15 Gbits/sec                  sender
[  5]   0.00-3.00   sec   411 MBytes  1.15 Gbits/sec                  receiver

iperf Done.
";

/// What a policy does to probe traffic once enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEffect {
    Deny,
    Allow,
}

/// A workload created by a manifest.
#[derive(Debug, Clone)]
pub struct FakeWorkload {
    pub selector: String,
    pub pod_name: String,
    pub ip: IpAddr,
}

impl FakeWorkload {
    pub fn new(selector: &str, pod_name: &str, ip: [u8; 4]) -> Self {
        Self {
            selector: selector.to_string(),
            pod_name: pod_name.to_string(),
            ip: IpAddr::V4(Ipv4Addr::from(ip)),
        }
    }
}

/// What applying a manifest creates.
#[derive(Debug, Clone)]
pub enum FakeManifest {
    Workloads {
        workloads: Vec<FakeWorkload>,
        /// Service names that route to the workloads.
        services: Vec<String>,
    },
    Policy {
        name: String,
        effect: PolicyEffect,
    },
}

#[derive(Debug, Clone)]
struct FakePod {
    manifest: String,
    namespace: String,
    selector: String,
    name: String,
    ip: IpAddr,
    /// Remaining list calls before a terminating pod disappears.
    terminating: Option<u32>,
}

#[derive(Debug, Clone)]
struct FakePolicy {
    manifest: String,
    namespace: String,
    name: String,
    effect: PolicyEffect,
    /// Status or agent polls left before the policy reads as programmed.
    pending_polls: u32,
}

/// Server pods that are replaced with a new address mid-run.
#[derive(Debug, Clone)]
struct WorkloadRestart {
    selector: String,
    after_probe_execs: u32,
    ip: IpAddr,
}

#[derive(Debug, Default)]
struct Faults {
    rejected_apply: HashSet<String>,
    failing_delete: HashSet<String>,
    never_ready: HashSet<String>,
    missing_probe_binary: bool,
    protocol_unsupported: bool,
    unreachable: bool,
    stuck_termination: bool,
    /// List calls a deleted pod stays in Terminating.
    termination_polls: u32,
    /// Status polls before a policy is programmed.
    programming_polls: u32,
    /// Probes after a policy change that still see the previous regime.
    enforcement_lag: u32,
    /// Policy objects never get per-node status.
    object_status_unreported: bool,
    /// Agent pods lack the agent CLI.
    agent_cli_missing: bool,
    workload_restart: Option<WorkloadRestart>,
}

#[derive(Debug, Default)]
struct Inner {
    manifests: HashMap<String, FakeManifest>,
    services: HashSet<String>,
    pods: Vec<FakePod>,
    /// Enforcement agent pods; never created or deleted by manifests.
    agent_pods: Vec<FakePod>,
    policies: Vec<FakePolicy>,
    faults: Faults,
    agent_logs: Vec<String>,
    calls: Vec<String>,
    /// Deny state probes currently observe.
    effective_deny: bool,
    lag_remaining: u32,
    /// Agent policy repository revision, bumped on every policy change.
    revision: u64,
    /// Execs outside the agent pods so far.
    probe_execs: u32,
    exec_latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
}

impl Inner {
    fn enforced_deny(&self) -> bool {
        self.policies
            .iter()
            .any(|p| p.effect == PolicyEffect::Deny && p.pending_polls == 0)
    }

    fn policy_changed(&mut self) {
        self.lag_remaining = self.faults.enforcement_lag;
        self.revision += 1;
    }

    /// Agent CLI: `policy get` and `policy wait`; anything else prints OK.
    fn agent_command(&mut self, command: String, argv: &[String]) -> CommandOutput {
        let cli = argv.first().map_or("cilium-dbg", String::as_str);
        if self.faults.agent_cli_missing {
            return output(
                command,
                126,
                "",
                &format!(
                    "OCI runtime exec failed: exec failed: unable to start container process: exec: \"{cli}\": executable file not found in $PATH"
                ),
            );
        }

        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        match args.as_slice() {
            ["policy", "get", ..] => {
                let stdout = self.policy_repository();
                output(command, 0, &stdout, "")
            }
            ["policy", "wait", revision, ..] => match revision.parse::<u64>() {
                Ok(wanted) if wanted <= self.revision => {
                    output(command, 0, "All endpoints have reached the policy revision", "")
                }
                Ok(wanted) => output(
                    command,
                    1,
                    "",
                    &format!("timeout while waiting for policy revision {wanted}"),
                ),
                Err(_) => output(command, 1, "", "Error: invalid revision"),
            },
            _ => output(command, 0, "OK", ""),
        }
    }

    /// `policy get -o json`: rules of every programmed policy. Each read
    /// counts as one acknowledgement poll for policies still pending.
    fn policy_repository(&mut self) -> String {
        let mut rules = Vec::new();
        for policy in &mut self.policies {
            if policy.pending_polls > 0 {
                policy.pending_polls -= 1;
                continue;
            }
            rules.push(serde_json::json!({
                "endpointSelector": { "matchLabels": { "k8s:app": "iperf3-server" } },
                "labels": [
                    { "key": "io.cilium.k8s.policy.derived-from", "value": "CiliumNetworkPolicy", "source": "k8s" },
                    { "key": "io.cilium.k8s.policy.name", "value": policy.name, "source": "k8s" },
                    { "key": "io.cilium.k8s.policy.namespace", "value": policy.namespace, "source": "k8s" }
                ]
            }));
        }
        serde_json::json!({
            "revision": self.revision,
            "policy": serde_json::Value::Array(rules).to_string()
        })
        .to_string()
    }

    /// Outcome of a traffic generator run from a workload pod.
    fn probe_result(&mut self, command: String, argv: &[String]) -> CommandOutput {
        if self.faults.missing_probe_binary {
            return output(
                command,
                126,
                "",
                "OCI runtime exec failed: exec failed: unable to start container process: exec: \"iperf3\": executable file not found in $PATH",
            );
        }

        let destination = argv
            .iter()
            .position(|a| a == "-c")
            .and_then(|i| argv.get(i + 1))
            .cloned()
            .unwrap_or_default();

        if self.faults.protocol_unsupported {
            return output(
                command,
                1,
                "",
                "iperf3: error - unable to connect to server: Protocol not supported",
            );
        }
        if !self.reachable(&destination) {
            return output(
                command,
                1,
                "",
                &format!("iperf3: error - unable to resolve host {destination}: Name or service not known"),
            );
        }

        if self.observe_deny() {
            output(
                command,
                TIMEOUT_EXIT,
                "",
                "command terminated with exit code 124",
            )
        } else {
            output(command, 0, IPERF3_SUCCESS, "")
        }
    }

    /// Apply a configured workload restart once enough probes have run.
    fn count_probe_exec(&mut self) {
        self.probe_execs += 1;
        let Some(restart) = self.faults.workload_restart.clone() else {
            return;
        };
        if self.probe_execs == restart.after_probe_execs {
            for pod in self.pods.iter_mut().filter(|p| p.selector == restart.selector) {
                pod.ip = restart.ip;
            }
        }
    }

    /// Deny state seen by the next probe, honouring enforcement lag.
    fn observe_deny(&mut self) -> bool {
        let current = self.enforced_deny();
        if current != self.effective_deny {
            if self.lag_remaining > 0 {
                self.lag_remaining -= 1;
            } else {
                self.effective_deny = current;
            }
        }
        self.effective_deny
    }

    fn reachable(&self, destination: &str) -> bool {
        self.services.contains(destination)
            || self
                .pods
                .iter()
                .any(|p| p.terminating.is_none() && p.ip.to_string() == destination)
    }

    /// Age terminating pods by one list call.
    fn tick_termination(&mut self) {
        if self.faults.stuck_termination {
            return;
        }
        for pod in &mut self.pods {
            if let Some(left) = pod.terminating.as_mut() {
                *left = left.saturating_sub(1);
            }
        }
        self.pods.retain(|p| p.terminating != Some(0));
    }
}

/// In-memory cluster implementing [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn output(command: String, exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        command,
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

impl FakeCluster {
    /// A cluster that knows the iperf3 workload pair and both SCTP policies.
    #[must_use]
    pub fn new() -> Self {
        let agent = FakePod {
            manifest: String::new(),
            namespace: "kube-system".to_string(),
            selector: "k8s-app=cilium".to_string(),
            name: "cilium-x7k2p".to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(172, 18, 0, 3)),
            terminating: None,
        };
        let cluster = Self {
            inner: Arc::new(Mutex::new(Inner {
                agent_pods: vec![agent],
                ..Inner::default()
            })),
        };
        cluster
            .with_manifest(
                "iperf3.yaml",
                FakeManifest::Workloads {
                    workloads: vec![
                        FakeWorkload::new("app=iperf3-client", "iperf3-client-7d9f8", [10, 244, 1, 5]),
                        FakeWorkload::new("app=iperf3-server", "iperf3-server-5c6b4", [10, 244, 2, 7]),
                    ],
                    services: vec!["iperf3-server".to_string()],
                },
            )
            .with_manifest(
                "policy-no-sctp.yaml",
                FakeManifest::Policy {
                    name: "sctp-deny".to_string(),
                    effect: PolicyEffect::Deny,
                },
            )
            .with_manifest(
                "policy-allow-sctp.yaml",
                FakeManifest::Policy {
                    name: "sctp-allow".to_string(),
                    effect: PolicyEffect::Allow,
                },
            )
    }

    /// Register what applying `file` creates.
    #[must_use]
    pub fn with_manifest(self, file: &str, manifest: FakeManifest) -> Self {
        self.inner
            .lock()
            .unwrap()
            .manifests
            .insert(file.to_string(), manifest);
        self
    }

    /// Applying `file` is rejected by the API server.
    #[must_use]
    pub fn with_rejected_apply(self, file: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .faults
            .rejected_apply
            .insert(file.to_string());
        self
    }

    /// Deleting `file` fails with a permission error.
    #[must_use]
    pub fn with_failing_delete(self, file: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .faults
            .failing_delete
            .insert(file.to_string());
        self
    }

    /// Pods matching `selector` never become ready.
    #[must_use]
    pub fn with_never_ready(self, selector: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .faults
            .never_ready
            .insert(selector.to_string());
        self
    }

    /// The client image lacks the traffic generator.
    #[must_use]
    pub fn with_missing_probe_binary(self) -> Self {
        self.inner.lock().unwrap().faults.missing_probe_binary = true;
        self
    }

    /// Node kernels lack the probed protocol.
    #[must_use]
    pub fn with_protocol_unsupported(self) -> Self {
        self.inner.lock().unwrap().faults.protocol_unsupported = true;
        self
    }

    /// `cluster-info` fails.
    #[must_use]
    pub fn unreachable(self) -> Self {
        self.inner.lock().unwrap().faults.unreachable = true;
        self
    }

    /// Deleted pods stay in Terminating forever.
    #[must_use]
    pub fn with_stuck_termination(self) -> Self {
        self.inner.lock().unwrap().faults.stuck_termination = true;
        self
    }

    /// Deleted pods stay in Terminating for `polls` list calls.
    #[must_use]
    pub fn with_termination_polls(self, polls: u32) -> Self {
        self.inner.lock().unwrap().faults.termination_polls = polls;
        self
    }

    /// Policies read as pending for `polls` status queries.
    #[must_use]
    pub fn with_programming_polls(self, polls: u32) -> Self {
        self.inner.lock().unwrap().faults.programming_polls = polls;
        self
    }

    /// Policy objects never get per-node status; only the agents can
    /// confirm programming.
    #[must_use]
    pub fn without_object_status(self) -> Self {
        self.inner.lock().unwrap().faults.object_status_unreported = true;
        self
    }

    /// Agent pods run but lack the agent CLI.
    #[must_use]
    pub fn without_agent_cli(self) -> Self {
        self.inner.lock().unwrap().faults.agent_cli_missing = true;
        self
    }

    /// Pods matching `selector` come back at `ip` once `probes` probe execs
    /// have completed.
    #[must_use]
    pub fn with_workload_restart(self, selector: &str, probes: u32, ip: [u8; 4]) -> Self {
        self.inner.lock().unwrap().faults.workload_restart = Some(WorkloadRestart {
            selector: selector.to_string(),
            after_probe_execs: probes,
            ip: IpAddr::V4(Ipv4Addr::from(ip)),
        });
        self
    }

    /// The first `probes` probes after each policy change see the old regime.
    #[must_use]
    pub fn with_enforcement_lag(self, probes: u32) -> Self {
        self.inner.lock().unwrap().faults.enforcement_lag = probes;
        self
    }

    /// Every exec takes `latency` of (tokio) time.
    #[must_use]
    pub fn with_exec_latency(self, latency: Duration) -> Self {
        self.inner.lock().unwrap().exec_latency = latency;
        self
    }

    /// Lines returned by `logs` for the agent pods.
    #[must_use]
    pub fn with_agent_logs(self, lines: &[&str]) -> Self {
        self.inner
            .lock()
            .unwrap()
            .agent_logs
            .extend(lines.iter().map(|l| (*l).to_string()));
        self
    }

    /// Every control-plane call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls starting with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Names of pods that still exist, terminating or not.
    pub fn live_pods(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Names of policies that still exist.
    pub fn live_policies(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .policies
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// No pods or policies remain.
    pub fn is_clean(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pods.is_empty() && inner.policies.is_empty()
    }

    /// Highest number of execs observed running at once.
    pub fn max_concurrent_execs(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ControlPlane for FakeCluster {
    async fn cluster_info(&self) -> Result<CommandOutput> {
        self.record("cluster-info".to_string());
        let inner = self.inner.lock().unwrap();
        if inner.faults.unreachable {
            return Ok(output(
                "kubectl cluster-info".to_string(),
                1,
                "",
                "The connection to the server 127.0.0.1:6443 was refused",
            ));
        }
        Ok(output(
            "kubectl cluster-info".to_string(),
            0,
            "Kubernetes control plane is running at https://127.0.0.1:6443",
            "",
        ))
    }

    async fn apply(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput> {
        let file = file_key(manifest);
        self.record(format!("apply {file}"));
        let command = format!("kubectl apply -n {namespace} -f {}", manifest.display());

        let mut inner = self.inner.lock().unwrap();
        if inner.faults.rejected_apply.contains(&file) {
            return Ok(output(
                command,
                1,
                "",
                "Error from server (Forbidden): admission webhook \"policy.example\" denied the request",
            ));
        }

        let Some(definition) = inner.manifests.get(&file).cloned() else {
            return Ok(output(
                command,
                1,
                "",
                &format!("error: the path \"{}\" does not exist", manifest.display()),
            ));
        };

        match definition {
            FakeManifest::Workloads {
                workloads,
                services,
            } => {
                for workload in workloads {
                    let exists = inner
                        .pods
                        .iter()
                        .any(|p| p.name == workload.pod_name && p.terminating.is_none());
                    if !exists {
                        inner.pods.push(FakePod {
                            manifest: file.clone(),
                            namespace: namespace.to_string(),
                            selector: workload.selector,
                            name: workload.pod_name,
                            ip: workload.ip,
                            terminating: None,
                        });
                    }
                }
                inner.services.extend(services);
                Ok(output(command, 0, "deployment.apps/iperf3 configured", ""))
            }
            FakeManifest::Policy { name, effect } => {
                let pending_polls = inner.faults.programming_polls;
                inner.policies.retain(|p| p.name != name);
                inner.policies.push(FakePolicy {
                    manifest: file.clone(),
                    namespace: namespace.to_string(),
                    name: name.clone(),
                    effect,
                    pending_polls,
                });
                inner.policy_changed();
                Ok(output(
                    command,
                    0,
                    &format!("ciliumnetworkpolicy.cilium.io/{name} created"),
                    "",
                ))
            }
        }
    }

    async fn delete(&self, manifest: &Path, namespace: &str) -> Result<CommandOutput> {
        let file = file_key(manifest);
        self.record(format!("delete {file}"));
        let command = format!(
            "kubectl delete -n {namespace} -f {} --ignore-not-found=true --wait=false",
            manifest.display()
        );

        let mut inner = self.inner.lock().unwrap();
        if inner.faults.failing_delete.contains(&file) {
            return Ok(output(
                command,
                1,
                "",
                "Error from server (Forbidden): cannot delete resource in namespace",
            ));
        }

        let polls = inner.faults.termination_polls.max(1);
        for pod in inner
            .pods
            .iter_mut()
            .filter(|p| p.manifest == file && p.namespace == namespace)
        {
            pod.terminating.get_or_insert(polls);
        }

        let before = inner.policies.len();
        inner
            .policies
            .retain(|p| !(p.manifest == file && p.namespace == namespace));
        if inner.policies.len() != before {
            inner.policy_changed();
        }

        // --ignore-not-found: deleting nothing still succeeds
        Ok(output(command, 0, "", ""))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        self.record(format!("list {namespace} {selector}"));
        let mut inner = self.inner.lock().unwrap();
        inner.tick_termination();

        let never_ready = &inner.faults.never_ready;
        Ok(inner
            .pods
            .iter()
            .chain(inner.agent_pods.iter())
            .filter(|p| p.namespace == namespace && (selector.is_empty() || p.selector == selector))
            .map(|p| PodInfo {
                name: p.name.clone(),
                ip: Some(p.ip),
                phase: if never_ready.contains(&p.selector) {
                    "Pending".to_string()
                } else {
                    "Running".to_string()
                },
                ready: !never_ready.contains(&p.selector),
                terminating: p.terminating.is_some(),
            })
            .collect())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        argv: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        let rendered = argv.join(" ");
        self.record(format!("exec {pod} {rendered}"));
        let command = format!("kubectl exec -n {namespace} {pod} -- {rendered}");

        let latency = {
            let mut inner = self.inner.lock().unwrap();
            let exists = inner
                .pods
                .iter()
                .chain(inner.agent_pods.iter())
                .any(|p| p.name == pod && p.terminating.is_none());
            if !exists {
                return Err(HarnessError::Command {
                    command,
                    message: format!("pods \"{pod}\" not found"),
                });
            }
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            inner.exec_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;

        if argv.first().is_some_and(|a| a.starts_with("cilium")) {
            return Ok(inner.agent_command(command, argv));
        }

        let result = inner.probe_result(command, argv);
        inner.count_probe_exec();
        Ok(result)
    }

    async fn policy_status(&self, namespace: &str, _kind: &str, name: &str) -> Result<PolicyStatus> {
        self.record(format!("status {name}"));
        let mut inner = self.inner.lock().unwrap();
        let unreported = inner.faults.object_status_unreported;
        let Some(policy) = inner
            .policies
            .iter_mut()
            .find(|p| p.name == name && p.namespace == namespace)
        else {
            return Ok(PolicyStatus::Absent);
        };

        if unreported {
            return Ok(PolicyStatus::Pending {
                detail: "no node has reported status".to_string(),
            });
        }

        if policy.pending_polls > 0 {
            policy.pending_polls -= 1;
            return Ok(PolicyStatus::Pending {
                detail: "1/2 nodes not enforcing: kind-worker2 (regenerating)".to_string(),
            });
        }
        Ok(PolicyStatus::Programmed)
    }

    async fn logs(&self, namespace: &str, selector: &str, since: Duration) -> Result<String> {
        self.record(format!("logs {namespace} {selector} {}s", since.as_secs()));
        Ok(self.inner.lock().unwrap().agent_logs.join("\n"))
    }

    async fn describe(&self, target: DescribeTarget, namespace: &str) -> Result<CommandOutput> {
        self.record(format!("describe {}", target.as_str()));
        Ok(output(
            format!("kubectl describe {} -n {namespace}", target.as_str()),
            0,
            "Name: kind-worker\nConditions: Ready True",
            "",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_argv(destination: &str) -> Vec<String> {
        ["timeout", "5", "iperf3", "-i", "1", "-t", "3", "--sctp", "-c", destination]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_apply_creates_pods_and_delete_terminates_them() {
        let cluster = FakeCluster::new();
        let manifest = Path::new("manifests/sctp/iperf3.yaml");

        let out = cluster.apply(manifest, "default").await.unwrap();
        assert!(out.success());
        assert_eq!(cluster.list_pods("default", "app=iperf3-server").await.unwrap().len(), 1);

        cluster.delete(manifest, "default").await.unwrap();
        // Terminating pods are reaped on the next list call
        assert!(cluster.list_pods("default", "").await.unwrap().is_empty());
        assert!(cluster.is_clean());
    }

    #[tokio::test]
    async fn test_deny_policy_blocks_probes_once_programmed() {
        let cluster = FakeCluster::new().with_programming_polls(1);
        cluster.apply(Path::new("iperf3.yaml"), "default").await.unwrap();
        cluster.apply(Path::new("policy-no-sctp.yaml"), "default").await.unwrap();

        let status = cluster.policy_status("default", "cnp", "sctp-deny").await.unwrap();
        assert!(matches!(status, PolicyStatus::Pending { .. }));
        let status = cluster.policy_status("default", "cnp", "sctp-deny").await.unwrap();
        assert_eq!(status, PolicyStatus::Programmed);

        let out = cluster
            .exec("default", "iperf3-client-7d9f8", &probe_argv("iperf3-server"), Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(124));
    }

    fn agent_argv(args: &[&str]) -> Vec<String> {
        std::iter::once("cilium-dbg")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_agent_repository_tracks_programmed_policies() {
        let cluster = FakeCluster::new().with_programming_polls(1);
        cluster.apply(Path::new("policy-no-sctp.yaml"), "default").await.unwrap();
        let get = agent_argv(&["policy", "get", "-o", "json"]);
        let timeout = Duration::from_secs(5);

        let pending = cluster.exec("kube-system", "cilium-x7k2p", &get, timeout).await.unwrap();
        assert!(!pending.stdout.contains("sctp-deny"), "{}", pending.stdout);

        let programmed = cluster.exec("kube-system", "cilium-x7k2p", &get, timeout).await.unwrap();
        let repository: serde_json::Value = serde_json::from_str(&programmed.stdout).unwrap();
        assert_eq!(repository["revision"], 1);
        assert!(repository["policy"].as_str().unwrap().contains("sctp-deny"));

        let wait = |rev: &str| agent_argv(&["policy", "wait", rev, "--max-wait-time", "1s"]);
        let reached = cluster.exec("kube-system", "cilium-x7k2p", &wait("1"), timeout).await.unwrap();
        assert!(reached.success());
        let ahead = cluster.exec("kube-system", "cilium-x7k2p", &wait("2"), timeout).await.unwrap();
        assert!(!ahead.success());
    }

    #[tokio::test]
    async fn test_unreported_object_status_stays_pending() {
        let cluster = FakeCluster::new().without_object_status();
        cluster.apply(Path::new("policy-no-sctp.yaml"), "default").await.unwrap();

        let status = cluster.policy_status("default", "cnp", "sctp-deny").await.unwrap();
        assert!(matches!(status, PolicyStatus::Pending { .. }));

        cluster.delete(Path::new("policy-no-sctp.yaml"), "default").await.unwrap();
        let status = cluster.policy_status("default", "cnp", "sctp-deny").await.unwrap();
        assert_eq!(status, PolicyStatus::Absent);
    }

    #[tokio::test]
    async fn test_workload_restart_moves_pod_address() {
        let cluster = FakeCluster::new().with_workload_restart("app=iperf3-server", 1, [10, 244, 2, 8]);
        cluster.apply(Path::new("iperf3.yaml"), "default").await.unwrap();
        let timeout = Duration::from_secs(20);

        let first = cluster.exec("default", "iperf3-client-7d9f8", &probe_argv("10.244.2.7"), timeout).await.unwrap();
        assert!(first.success());
        let stale = cluster.exec("default", "iperf3-client-7d9f8", &probe_argv("10.244.2.7"), timeout).await.unwrap();
        assert!(!stale.success());
        let fresh = cluster.exec("default", "iperf3-client-7d9f8", &probe_argv("10.244.2.8"), timeout).await.unwrap();
        assert!(fresh.success());
    }

    #[tokio::test]
    async fn test_enforcement_lag_shows_previous_regime() {
        let cluster = FakeCluster::new().with_enforcement_lag(1);
        cluster.apply(Path::new("iperf3.yaml"), "default").await.unwrap();
        cluster.apply(Path::new("policy-no-sctp.yaml"), "default").await.unwrap();

        let argv = probe_argv("10.244.2.7");
        let first = cluster.exec("default", "iperf3-client-7d9f8", &argv, Duration::from_secs(20)).await.unwrap();
        let second = cluster.exec("default", "iperf3-client-7d9f8", &argv, Duration::from_secs(20)).await.unwrap();
        assert_eq!(first.exit_code, Some(0));
        assert_eq!(second.exit_code, Some(124));
    }

    #[tokio::test]
    async fn test_agent_pods_survive_teardown() {
        let cluster = FakeCluster::new();
        let agents = cluster.list_pods("kube-system", "k8s-app=cilium").await.unwrap();
        assert_eq!(agents.len(), 1);
        assert!(cluster.is_clean());

        let argv = vec!["cilium-dbg".to_string(), "status".to_string()];
        let out = cluster.exec("kube-system", "cilium-x7k2p", &argv, Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_rejected_apply_creates_nothing() {
        let cluster = FakeCluster::new().with_rejected_apply("iperf3.yaml");
        let out = cluster.apply(Path::new("iperf3.yaml"), "default").await.unwrap();
        assert!(!out.success());
        assert!(cluster.is_clean());
    }
}
