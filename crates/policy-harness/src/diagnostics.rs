//! Failure-time diagnostics.
//!
//! Captured at the point of failure, before teardown destroys the evidence:
//! node and pod descriptions plus agent status reports exec'd inside one
//! enforcement agent pod. Capture never fails a scenario; a command that
//! could not run is recorded with its error instead of its output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::session::{ClusterSession, CommandOutput, DescribeTarget};

/// One captured diagnostic artifact.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub label: String,
    pub captured_at: DateTime<Utc>,
    pub output: Option<CommandOutput>,
    pub error: Option<String>,
}

impl Diagnostic {
    fn from_result(label: String, result: crate::errors::Result<CommandOutput>) -> Self {
        let (output, error) = match result {
            Ok(output) => (Some(output), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            label,
            captured_at: Utc::now(),
            output,
            error,
        }
    }
}

/// Where to look and what to run when capturing diagnostics.
#[derive(Debug, Clone)]
pub struct DiagnosticsPlan {
    pub namespace: String,
    pub agent_namespace: String,
    pub agent_selector: String,
    pub agent_commands: Vec<Vec<String>>,
}

/// Capture cluster state for a failed scenario.
#[instrument(skip_all, name = "harness.diagnostics.capture", fields(reason = %reason))]
pub async fn capture(session: &ClusterSession, plan: &DiagnosticsPlan, reason: &str) -> Vec<Diagnostic> {
    let control_plane = match session.control_plane() {
        Ok(cp) => cp,
        Err(e) => {
            warn!(target: "harness.diagnostics", error = %e, "Cannot capture diagnostics");
            return vec![Diagnostic::from_result("session".to_string(), Err(e))];
        }
    };

    let mut captured = Vec::new();
    for target in [DescribeTarget::Nodes, DescribeTarget::Pods] {
        let result = control_plane.describe(target, &plan.namespace).await;
        captured.push(Diagnostic::from_result(format!("describe {}", target.as_str()), result));
    }

    if !plan.agent_commands.is_empty() {
        let agent = control_plane
            .list_pods(&plan.agent_namespace, &plan.agent_selector)
            .await
            .map(|pods| pods.into_iter().find(|p| p.is_running_and_ready()));

        match agent {
            Ok(Some(pod)) => {
                for argv in &plan.agent_commands {
                    let result = control_plane
                        .exec(&plan.agent_namespace, &pod.name, argv, session.command_timeout())
                        .await;
                    captured.push(Diagnostic::from_result(
                        format!("{}: {}", pod.name, argv.join(" ")),
                        result,
                    ));
                }
            }
            Ok(None) => {
                warn!(
                    target: "harness.diagnostics",
                    selector = %plan.agent_selector,
                    "No ready agent pod for status report"
                );
            }
            Err(e) => captured.push(Diagnostic::from_result("agent pods".to_string(), Err(e))),
        }
    }

    info!(target: "harness.diagnostics", artifacts = captured.len(), "Diagnostics captured");
    captured
}
