//! Policy transitions.
//!
//! Applying a policy is not complete when the API server accepts the
//! manifest: the enforcement layer programs it asynchronously on every
//! node. [`PolicyManager::apply_policy`] therefore polls until the change is
//! acknowledged, and records the instant that acknowledgement arrived so
//! later probes can tell convergence lag apart from enforcement failures.
//!
//! With [`Acknowledgement::Agents`] every enforcement agent pod is asked
//! directly: the policy's rules must be imported into (or gone from) the
//! agent's repository, and the agent's endpoints must have realized that
//! repository revision. Agents do not write per-node status back to the
//! policy object, so the object status is only consulted when no agent can
//! be queried.
//!
//! Policies with different names compose. Replacing one regime with another
//! (block → allow) goes through [`PolicyManager::replace_policy`], which
//! deletes every active policy and waits for it to disappear before the
//! next one is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::errors::{HarnessError, Result};
use crate::eventual::{retry_until, RetryPolicy, WaitKind};
use crate::manifest::{ManifestController, ManifestRef};
use crate::session::{ClusterSession, ControlPlane, PolicyStatus};

/// Default resource kind of policy objects.
pub const DEFAULT_POLICY_KIND: &str = "ciliumnetworkpolicies";

/// Default agent CLI inside the enforcement agent pods.
pub const DEFAULT_AGENT_CLI: &str = "cilium-dbg";

/// Labels the agent attaches to rules imported from a policy object.
const POLICY_NAME_LABEL: &str = "io.cilium.k8s.policy.name";
const POLICY_NAMESPACE_LABEL: &str = "io.cilium.k8s.policy.namespace";

/// How a policy change is confirmed as programmed or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Per-node status written back to the policy object.
    ObjectStatus,
    /// The policy repository of every ready enforcement agent pod, falling
    /// back to object status for any poll in which no agent answers.
    Agents {
        namespace: String,
        selector: String,
        /// CLI exec'd in the agent pods (`<cli> policy get|wait`).
        cli: String,
    },
}

/// A named policy object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyObject {
    pub manifest: ManifestRef,
    pub namespace: String,
    /// `metadata.name` of the policy object.
    pub name: String,
    /// Resource kind used for status queries.
    pub kind: String,
}

impl PolicyObject {
    pub fn new(manifest: ManifestRef, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            manifest,
            namespace: namespace.into(),
            name: name.into(),
            kind: DEFAULT_POLICY_KIND.to_string(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// A completed policy transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub policy: String,
    /// Policies deleted to make room for this one.
    pub replaced: Vec<String>,
    /// Monotonic instant the enforcement layer acknowledged programming.
    pub acknowledged_at: Instant,
    pub acknowledged_wall: DateTime<Utc>,
}

/// Applies, replaces and removes policies for one scenario.
#[derive(Debug)]
pub struct PolicyManager<'a> {
    session: &'a ClusterSession,
    acknowledgement: Acknowledgement,
    /// Policies submitted in this scenario and not yet deleted, oldest first.
    active: Vec<PolicyObject>,
}

impl<'a> PolicyManager<'a> {
    /// A manager confirming changes through the policy object's status.
    pub fn new(session: &'a ClusterSession) -> Self {
        Self {
            session,
            acknowledgement: Acknowledgement::ObjectStatus,
            active: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_acknowledgement(mut self, acknowledgement: Acknowledgement) -> Self {
        self.acknowledgement = acknowledgement;
        self
    }

    /// Names of the policies currently in force.
    pub fn active_names(&self) -> Vec<&str> {
        self.active.iter().map(|p| p.name.as_str()).collect()
    }

    /// Submit `policy` and block until it is programmed.
    ///
    /// Any policy already active under a different name stays active.
    #[instrument(skip_all, name = "harness.policy.apply", fields(policy = %policy.name))]
    pub async fn apply_policy(
        &mut self,
        policy: &PolicyObject,
        timeout: Duration,
    ) -> Result<Transition> {
        // Track before submitting so teardown removes a half-applied policy
        self.active.retain(|p| p.name != policy.name);
        self.active.push(policy.clone());

        let output = self
            .session
            .control_plane()?
            .apply(&policy.manifest.path, &policy.namespace)
            .await
            .map_err(|e| HarnessError::PolicyApply {
                policy: policy.name.clone(),
                output: e.to_string(),
            })?;

        if !output.success() {
            return Err(HarnessError::PolicyApply {
                policy: policy.name.clone(),
                output: output.combined_output(),
            });
        }

        self.wait_for_status(policy, true, timeout).await?;

        let transition = Transition {
            policy: policy.name.clone(),
            replaced: Vec::new(),
            acknowledged_at: Instant::now(),
            acknowledged_wall: Utc::now(),
        };

        info!(
            target: "harness.policy",
            policy = %policy.name,
            active = ?self.active_names(),
            "Policy programmed"
        );
        Ok(transition)
    }

    /// Remove every active policy, then apply `next`.
    #[instrument(skip_all, name = "harness.policy.replace", fields(policy = %next.name))]
    pub async fn replace_policy(
        &mut self,
        next: &PolicyObject,
        timeout: Duration,
    ) -> Result<Transition> {
        let outgoing: Vec<PolicyObject> = self
            .active
            .iter()
            .filter(|p| p.manifest != next.manifest)
            .cloned()
            .collect();

        let mut replaced = Vec::with_capacity(outgoing.len());
        for policy in &outgoing {
            self.remove_policy(policy, timeout).await?;
            replaced.push(policy.name.clone());
        }

        let mut transition = self.apply_policy(next, timeout).await?;
        transition.replaced = replaced;
        Ok(transition)
    }

    /// Return to a previously applied policy, removing everything else.
    pub async fn rollback(&mut self, to: &PolicyObject, timeout: Duration) -> Result<Transition> {
        info!(
            target: "harness.policy",
            policy = %to.name,
            from = ?self.active_names(),
            "Rolling back policy regime"
        );
        self.replace_policy(to, timeout).await
    }

    /// Delete `policy` and wait until its removal is acknowledged.
    #[instrument(skip_all, name = "harness.policy.remove", fields(policy = %policy.name))]
    pub async fn remove_policy(&mut self, policy: &PolicyObject, timeout: Duration) -> Result<()> {
        ManifestController::new(self.session)
            .delete(&policy.manifest, &policy.namespace)
            .await?;
        self.wait_for_status(policy, false, timeout).await?;
        self.active.retain(|p| p.name != policy.name);
        info!(target: "harness.policy", policy = %policy.name, "Policy removed");
        Ok(())
    }

    /// Best-effort removal of every policy this manager applied.
    ///
    /// Does not wait for the status to clear; the termination barrier that
    /// follows teardown covers convergence.
    pub async fn remove_all(&mut self) -> Vec<HarnessError> {
        let controller = ManifestController::new(self.session);
        let mut failures = Vec::new();
        while let Some(policy) = self.active.pop() {
            if let Err(e) = controller.delete(&policy.manifest, &policy.namespace).await {
                warn!(
                    target: "harness.policy",
                    policy = %policy.name,
                    error = %e,
                    "Failed to remove policy"
                );
                failures.push(e);
            }
        }
        failures
    }

    async fn wait_for_status(
        &self,
        policy: &PolicyObject,
        programmed: bool,
        timeout: Duration,
    ) -> Result<()> {
        let control_plane = self.session.control_plane()?;
        let retry = RetryPolicy::new(self.session.poll_interval(), timeout);
        let session = self.session;
        let acknowledgement = &self.acknowledgement;

        retry_until(WaitKind::PolicyConvergence, retry, move || async move {
            if let Acknowledgement::Agents {
                namespace,
                selector,
                cli,
            } = acknowledgement
            {
                let agents = AgentQuery {
                    session,
                    control_plane,
                    namespace,
                    selector,
                    cli,
                };
                match agents.poll(policy, programmed).await {
                    AgentPoll::Converged => return Ok(()),
                    AgentPoll::Waiting(observation) => return Err(observation),
                    AgentPoll::Unavailable(reason) => {
                        debug!(
                            target: "harness.policy",
                            policy = %policy.name,
                            reason = %reason,
                            "Agents unavailable, reading object status"
                        );
                        return object_status(control_plane, policy, programmed)
                            .await
                            .map_err(|observation| {
                                format!("agents unavailable ({reason}); {observation}")
                            });
                    }
                }
            }
            object_status(control_plane, policy, programmed).await
        })
        .await
        .map_err(|timeout| HarnessError::Timeout {
            what: format!(
                "policy {} {}",
                policy.name,
                if programmed { "programmed" } else { "removed" }
            ),
            waited: timeout.waited,
            last_observation: timeout.last_observation,
        })
    }
}

/// One poll of the policy object's own status.
async fn object_status(
    control_plane: &dyn ControlPlane,
    policy: &PolicyObject,
    programmed: bool,
) -> std::result::Result<(), String> {
    let status = control_plane
        .policy_status(&policy.namespace, &policy.kind, &policy.name)
        .await
        .map_err(|e| format!("status query failed: {e}"))?;
    match (programmed, status) {
        (true, PolicyStatus::Programmed) | (false, PolicyStatus::Absent) => Ok(()),
        (_, PolicyStatus::Pending { detail }) => Err(format!("pending: {detail}")),
        (true, PolicyStatus::Absent) => Err("not yet visible".to_string()),
        (false, PolicyStatus::Programmed) => Err("still programmed".to_string()),
    }
}

enum AgentPoll {
    Converged,
    /// Agents answered but have not caught up.
    Waiting(String),
    /// No usable answer; fall back to object status.
    Unavailable(String),
}

struct AgentQuery<'q> {
    session: &'q ClusterSession,
    control_plane: &'q dyn ControlPlane,
    namespace: &'q str,
    selector: &'q str,
    cli: &'q str,
}

impl AgentQuery<'_> {
    async fn poll(&self, policy: &PolicyObject, programmed: bool) -> AgentPoll {
        let agents: Vec<String> = match self
            .session
            .pods_by_label(self.namespace, self.selector)
            .await
        {
            Ok(pods) => pods.into_iter().map(|(name, _)| name).collect(),
            Err(e) => return AgentPoll::Unavailable(format!("listing agents failed: {e}")),
        };
        if agents.is_empty() {
            return AgentPoll::Unavailable(format!("no ready pod matches {}", self.selector));
        }

        let mut revisions = Vec::with_capacity(agents.len());
        let mut lagging = Vec::new();
        for agent in &agents {
            let view = match self.exec(agent, &["policy", "get", "-o", "json"]).await {
                Ok(stdout) => parse_agent_policy(&stdout, &policy.namespace, &policy.name),
                Err(reason) => return AgentPoll::Unavailable(reason),
            };
            match view {
                Ok(view) if view.imported == programmed => {
                    revisions.push((agent, view.revision));
                }
                Ok(_) => lagging.push(agent.as_str()),
                Err(e) => return AgentPoll::Unavailable(format!("{agent}: {e}")),
            }
        }
        if !lagging.is_empty() {
            return AgentPoll::Waiting(format!(
                "{}/{} agents {} {}: {}",
                lagging.len(),
                agents.len(),
                if programmed { "have not imported" } else { "still hold" },
                policy.name,
                lagging.join(", ")
            ));
        }

        // Imported rules only bind once endpoints regenerate at that revision
        let max_wait = format!("{}s", self.session.poll_interval().as_secs().max(1));
        for (agent, revision) in revisions {
            let revision = revision.to_string();
            let wait = [
                "policy",
                "wait",
                revision.as_str(),
                "--max-wait-time",
                max_wait.as_str(),
            ];
            if let Err(reason) = self.exec(agent, &wait).await {
                return AgentPoll::Waiting(format!(
                    "endpoints not at revision {revision}: {reason}"
                ));
            }
        }
        AgentPoll::Converged
    }

    /// stdout of `<cli> <args>` in `agent`, or why it failed.
    async fn exec(&self, agent: &str, args: &[&str]) -> std::result::Result<String, String> {
        let mut argv = vec![self.cli.to_string()];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        let output = self
            .control_plane
            .exec(self.namespace, agent, &argv, self.session.command_timeout())
            .await
            .map_err(|e| format!("{agent}: {e}"))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(format!("{agent}: {}", output.combined_output().trim()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentPolicyJson {
    #[serde(default)]
    revision: u64,
    /// The repository's rules, itself JSON-encoded.
    #[serde(default)]
    policy: String,
}

#[derive(Debug, Deserialize)]
struct AgentRule {
    #[serde(default)]
    labels: Vec<AgentLabel>,
}

#[derive(Debug, Deserialize)]
struct AgentLabel {
    key: String,
    #[serde(default)]
    value: String,
}

/// What one agent's repository says about a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgentView {
    pub revision: u64,
    /// Some rule carries the policy's name and namespace labels.
    pub imported: bool,
}

/// Decode `<cli> policy get -o json` for the policy `namespace/name`.
pub(crate) fn parse_agent_policy(json: &str, namespace: &str, name: &str) -> Result<AgentView> {
    let repository: AgentPolicyJson = serde_json::from_str(json)?;
    let rules = repository.policy.trim();
    let rules: Vec<AgentRule> = if rules.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str::<Option<Vec<AgentRule>>>(rules)?.unwrap_or_default()
    };

    let label = |rule: &AgentRule, key: &str| {
        rule.labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.clone())
    };
    let imported = rules.iter().any(|rule| {
        label(rule, POLICY_NAME_LABEL).as_deref() == Some(name)
            && label(rule, POLICY_NAMESPACE_LABEL)
                .as_deref()
                .map_or(true, |ns| ns == namespace)
    });

    Ok(AgentView {
        revision: repository.revision,
        imported,
    })
}
