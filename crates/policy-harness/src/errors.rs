//! Harness error types.
//!
//! Phase errors (`Apply`, `PolicyApply`, `Timeout`, `NotReady`, `Command`,
//! `Parse`) abort the current scenario and route it to teardown. Probe-level
//! errors (`ProbeMismatch`, `Indeterminate`) are recorded against a single
//! verdict cell. `Teardown` never fails a verdict, it only warns.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Harness error type.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The control plane rejected a workload manifest.
    #[error("Apply of {manifest} rejected: {output}")]
    Apply { manifest: String, output: String },

    /// The control plane rejected a policy manifest.
    #[error("Policy {policy} rejected: {output}")]
    PolicyApply { policy: String, output: String },

    /// A readiness, termination, or convergence wait exceeded its budget.
    #[error("Timed out after {waited:?} waiting for {what}: {last_observation}")]
    Timeout {
        what: String,
        waited: Duration,
        last_observation: String,
    },

    /// Observed connectivity differs from the expected regime outcome.
    #[error("Probe {path} expected {expected}, observed {observed}")]
    ProbeMismatch {
        path: String,
        expected: String,
        observed: String,
    },

    /// The probe tooling failed or the enforcement layer had not converged.
    #[error("Probe {path} indeterminate: {reason}")]
    Indeterminate { path: String, reason: String },

    /// Cleanup failed; stale resources may contaminate later scenarios.
    #[error("Teardown of {resource} failed: {output}")]
    Teardown { resource: String, output: String },

    /// A probe targeted a workload that has not passed its readiness wait.
    #[error("Workload {selector} is not ready; wait_ready must succeed before probing")]
    NotReady { selector: String },

    /// A kubectl invocation could not be spawned or did not complete.
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// kubectl returned output that could not be decoded.
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// The control plane is unreachable or the session is closed.
    #[error("Cluster session error: {0}")]
    Session(String),

    /// Invalid harness configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// Returns true if this error ends the scenario (routes straight to teardown).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HarnessError::ProbeMismatch { .. }
                | HarnessError::Indeterminate { .. }
                | HarnessError::Teardown { .. }
        )
    }

    /// Short label used in logs and the verdict report.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Apply { .. } => "apply",
            HarnessError::PolicyApply { .. } => "policy_apply",
            HarnessError::Timeout { .. } => "timeout",
            HarnessError::ProbeMismatch { .. } => "probe_mismatch",
            HarnessError::Indeterminate { .. } => "indeterminate",
            HarnessError::Teardown { .. } => "teardown",
            HarnessError::NotReady { .. } => "not_ready",
            HarnessError::Command { .. } => "command",
            HarnessError::Parse { .. } => "parse",
            HarnessError::Session(_) => "session",
            HarnessError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Parse {
            what: "kubectl JSON output".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result alias using `HarnessError`.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_level_errors_are_not_fatal() {
        let mismatch = HarnessError::ProbeMismatch {
            path: "pod-to-pod".to_string(),
            expected: "BLOCKED".to_string(),
            observed: "ALLOWED".to_string(),
        };
        let indeterminate = HarnessError::Indeterminate {
            path: "pod-to-service".to_string(),
            reason: "iperf3 not found".to_string(),
        };
        let teardown = HarnessError::Teardown {
            resource: "iperf3.yaml".to_string(),
            output: "forbidden".to_string(),
        };

        assert!(!mismatch.is_fatal());
        assert!(!indeterminate.is_fatal());
        assert!(!teardown.is_fatal());
    }

    #[test]
    fn test_phase_errors_are_fatal() {
        let apply = HarnessError::Apply {
            manifest: "iperf3.yaml".to_string(),
            output: "exceeded quota".to_string(),
        };
        let timeout = HarnessError::Timeout {
            what: "pods app=iperf3-server".to_string(),
            waited: Duration::from_secs(240),
            last_observation: "0/1 ready".to_string(),
        };
        let not_ready = HarnessError::NotReady {
            selector: "app=iperf3-client".to_string(),
        };

        assert!(apply.is_fatal());
        assert!(timeout.is_fatal());
        assert!(not_ready.is_fatal());
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn test_timeout_display_includes_last_observation() {
        let err = HarnessError::Timeout {
            what: "policy sctp-deny programmed".to_string(),
            waited: Duration::from_secs(5),
            last_observation: "pending on 1/2 nodes".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("policy sctp-deny programmed"));
        assert!(msg.contains("pending on 1/2 nodes"));
    }
}
