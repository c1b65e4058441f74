//! Suite execution and the verdict report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::errors::{HarnessError, Result};
use crate::scenario::{ScenarioRunner, ScenarioSpec, ScenarioStatus, ScenarioVerdict};

/// Every scenario passed or was skipped.
pub const EXIT_PASSED: u8 = 0;
/// At least one probe observed the wrong outcome.
pub const EXIT_MISMATCH: u8 = 1;
/// No mismatch, but some cell could not be judged.
pub const EXIT_INDETERMINATE: u8 = 2;
/// A phase (apply, readiness, policy programming) failed.
pub const EXIT_PHASE_ERROR: u8 = 3;
/// Configuration invalid or the cluster session could not be opened.
pub const EXIT_CONFIG_ERROR: u8 = 4;

/// Outcome of a whole suite run.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ScenarioStatus,
    pub scenarios: Vec<ScenarioVerdict>,
}

impl SuiteReport {
    /// Process exit code for this report.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            ScenarioStatus::Passed | ScenarioStatus::Skipped => EXIT_PASSED,
            ScenarioStatus::Mismatch => EXIT_MISMATCH,
            ScenarioStatus::Indeterminate => EXIT_INDETERMINATE,
            ScenarioStatus::PhaseError => EXIT_PHASE_ERROR,
        }
    }

    /// Teardown and audit warnings from every scenario, prefixed by scenario.
    pub fn warnings(&self) -> Vec<String> {
        self.scenarios
            .iter()
            .flat_map(|v| {
                v.warnings
                    .iter()
                    .map(move |w| format!("{}: {w}", v.scenario))
            })
            .collect()
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, body).map_err(|e| HarnessError::Command {
            command: format!("write {}", path.display()),
            message: e.to_string(),
        })?;
        info!(target: "harness.suite", path = %path.display(), "Verdict report written");
        Ok(())
    }
}

/// Runs scenarios strictly one after another.
///
/// A scenario's teardown, including its termination wait, finishes before
/// the next scenario applies anything.
#[derive(Debug)]
pub struct Suite<'a> {
    runner: ScenarioRunner<'a>,
}

impl<'a> Suite<'a> {
    pub fn new(runner: ScenarioRunner<'a>) -> Self {
        Self { runner }
    }

    #[instrument(skip_all, name = "harness.suite.run", fields(scenarios = scenarios.len()))]
    pub async fn run(&self, scenarios: &[ScenarioSpec]) -> SuiteReport {
        let started_at = Utc::now();
        let mut verdicts = Vec::with_capacity(scenarios.len());
        for spec in scenarios {
            verdicts.push(self.runner.run(spec).await);
        }

        let status = verdicts
            .iter()
            .map(|v| v.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(ScenarioStatus::Passed);

        let report = SuiteReport {
            started_at,
            finished_at: Utc::now(),
            status,
            scenarios: verdicts,
        };

        for warning in report.warnings() {
            warn!(target: "harness.suite", warning = %warning, "Suite warning");
        }
        info!(
            target: "harness.suite",
            status = ?report.status,
            exit_code = report.exit_code(),
            "Suite finished"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn report(status: ScenarioStatus) -> SuiteReport {
        SuiteReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            scenarios: Vec::new(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(ScenarioStatus::Passed).exit_code(), 0);
        assert_eq!(report(ScenarioStatus::Skipped).exit_code(), 0);
        assert_eq!(report(ScenarioStatus::Mismatch).exit_code(), 1);
        assert_eq!(report(ScenarioStatus::Indeterminate).exit_code(), 2);
        assert_eq!(report(ScenarioStatus::PhaseError).exit_code(), 3);
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verdict.json");

        report(ScenarioStatus::Mismatch).write_json(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["status"], "mismatch");
        assert!(written["scenarios"].as_array().unwrap().is_empty());
    }
}
