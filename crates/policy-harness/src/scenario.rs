//! Scenario runner.
//!
//! One scenario walks a client/server workload pair through three policy
//! regimes and probes both traffic paths under each:
//!
//! ```text
//! Init → WorkloadsReady → RegimeNoneProbed → RegimeBlockApplied
//!      → RegimeBlockProbed → RegimeAllowApplied → RegimeAllowProbed
//!      → Teardown → Done
//! ```
//!
//! Any phase error moves the scenario to `Failed`, captures diagnostics and
//! skips the remaining probes. Teardown runs on every path. Probe mismatches
//! are recorded and the scenario keeps going.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{Anomaly, AuditRules, HealthAuditor, LogWindow};
use crate::config::{ConfigError, HarnessConfig};
use crate::diagnostics::{self, Diagnostic, DiagnosticsPlan};
use crate::errors::{HarnessError, Result};
use crate::manifest::{ManifestController, ManifestRef, ReadinessPredicate, ResourceLedger, Workload};
use crate::policy::{PolicyManager, PolicyObject};
use crate::probe::{
    assess, Assessment, ConvergenceWindow, IndeterminateReason, Outcome, ProbeEvidence,
    ProbeExecutor, ProbeRequest, Protocol, TrafficPath,
};
use crate::session::ClusterSession;

/// Workload pair manifest.
pub const WORKLOADS_MANIFEST: &str = "iperf3.yaml";

/// Policy denying the protocol between client and server.
pub const BLOCK_POLICY_MANIFEST: &str = "policy-no-sctp.yaml";

/// Policy allowing the protocol between client and server.
pub const ALLOW_POLICY_MANIFEST: &str = "policy-allow-sctp.yaml";

pub const BLOCK_POLICY_NAME: &str = "sctp-deny";
pub const ALLOW_POLICY_NAME: &str = "sctp-allow";

pub const CLIENT_SELECTOR: &str = "app=iperf3-client";
pub const SERVER_SELECTOR: &str = "app=iperf3-server";
pub const SERVER_SERVICE: &str = "iperf3-server";

/// Slack added to the audit log window to cover clock skew between nodes.
const AUDIT_WINDOW_MARGIN: Duration = Duration::from_secs(10);

/// Policy regime in force while probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    None,
    Block,
    Allow,
}

impl Regime {
    pub const SEQUENCE: [Regime; 3] = [Regime::None, Regime::Block, Regime::Allow];

    /// Expected outcome on every traffic path under this regime.
    pub fn expected(self) -> Outcome {
        match self {
            Regime::None | Regime::Allow => Outcome::Allowed,
            Regime::Block => Outcome::Blocked,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Regime::None => "none",
            Regime::Block => "block",
            Regime::Allow => "allow",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verdict cell: a traffic path under a regime.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub regime: Regime,
    pub path: TrafficPath,
    pub expected: Outcome,
    pub observed: Outcome,
    pub assessment: Assessment,
    pub evidence: Option<ProbeEvidence>,
    /// Why no probe ran, or why a re-probe could not run.
    pub error: Option<String>,
    /// Earlier attempts replaced by a re-probe after convergence lag.
    pub superseded: Vec<ProbeEvidence>,
}

impl ProbeResult {
    fn observed(
        regime: Regime,
        assessment: Assessment,
        evidence: ProbeEvidence,
        superseded: Vec<ProbeEvidence>,
    ) -> Self {
        Self {
            regime,
            path: evidence.path,
            expected: regime.expected(),
            observed: evidence.outcome,
            assessment,
            evidence: Some(evidence),
            error: None,
            superseded,
        }
    }

    fn unresolved(regime: Regime, path: TrafficPath, error: &HarnessError) -> Self {
        Self {
            regime,
            path,
            expected: regime.expected(),
            observed: Outcome::Error,
            assessment: Assessment::Indeterminate(IndeterminateReason::ToolFailure),
            evidence: None,
            error: Some(error.to_string()),
            superseded: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.assessment == Assessment::Passed
    }

    /// The probe-level error this cell represents, if it did not pass.
    pub fn to_error(&self) -> Option<HarnessError> {
        match self.assessment {
            Assessment::Passed => None,
            Assessment::Mismatch => Some(HarnessError::ProbeMismatch {
                path: self.path.to_string(),
                expected: self.expected.to_string(),
                observed: self.observed.to_string(),
            }),
            Assessment::Indeterminate(reason) => Some(HarnessError::Indeterminate {
                path: self.path.to_string(),
                reason: self.error.clone().unwrap_or_else(|| reason.to_string()),
            }),
        }
    }
}

/// Lifecycle states of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Init,
    WorkloadsReady,
    RegimeNoneProbed,
    RegimeBlockApplied,
    RegimeBlockProbed,
    RegimeAllowApplied,
    RegimeAllowProbed,
    Failed,
    Teardown,
    Done,
}

impl ScenarioState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ScenarioState) -> bool {
        use ScenarioState::*;
        match (self, next) {
            (Init, WorkloadsReady)
            | (WorkloadsReady, RegimeNoneProbed)
            | (RegimeNoneProbed, RegimeBlockApplied)
            | (RegimeBlockApplied, RegimeBlockProbed)
            | (RegimeBlockProbed, RegimeAllowApplied)
            | (RegimeAllowApplied, RegimeAllowProbed)
            | (RegimeAllowProbed, Teardown)
            | (Failed, Teardown)
            | (Teardown, Done)
            | (Init, Done) => true,
            (from, Failed) => !matches!(from, Failed | Teardown | Done),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ScenarioState,
    history: Vec<ScenarioState>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ScenarioState::Init,
            history: vec![ScenarioState::Init],
        }
    }

    fn advance(&mut self, next: ScenarioState) {
        if !self.state.can_advance_to(next) {
            warn!(
                target: "harness.scenario",
                from = ?self.state,
                to = ?next,
                "Unexpected scenario state transition"
            );
        }
        info!(target: "harness.scenario", state = ?next, "Scenario state");
        self.state = next;
        self.history.push(next);
    }
}

/// Overall result of one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Skipped,
    /// Only tooling failures or unresolved convergence lag.
    Indeterminate,
    Mismatch,
    PhaseError,
}

impl ScenarioStatus {
    /// Ordering used to pick the suite-wide status.
    pub fn severity(self) -> u8 {
        match self {
            ScenarioStatus::Passed | ScenarioStatus::Skipped => 0,
            ScenarioStatus::Indeterminate => 1,
            ScenarioStatus::Mismatch => 2,
            ScenarioStatus::PhaseError => 3,
        }
    }
}

/// The phase error that ended a scenario early.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseFailure {
    /// Last state reached before the failure.
    pub state: ScenarioState,
    pub kind: String,
    pub message: String,
}

/// Everything one scenario produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioVerdict {
    pub scenario: String,
    pub run_id: Uuid,
    pub protocol: Protocol,
    pub status: ScenarioStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<ProbeResult>,
    pub phase_error: Option<PhaseFailure>,
    pub skip_reason: Option<String>,
    /// Teardown and audit failures; never change the status.
    pub warnings: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    pub diagnostics: Vec<Diagnostic>,
    pub history: Vec<ScenarioState>,
}

impl ScenarioVerdict {
    fn new(spec: &ScenarioSpec) -> Self {
        Self {
            scenario: spec.name.clone(),
            run_id: Uuid::new_v4(),
            protocol: spec.protocol,
            status: ScenarioStatus::Passed,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
            phase_error: None,
            skip_reason: None,
            warnings: Vec::new(),
            anomalies: Vec::new(),
            diagnostics: Vec::new(),
            history: Vec::new(),
        }
    }

    fn finish(&mut self, history: Vec<ScenarioState>) {
        self.history = history;
        self.finished_at = Some(Utc::now());
        self.status = if self.skip_reason.is_some() {
            ScenarioStatus::Skipped
        } else if self.phase_error.is_some() {
            ScenarioStatus::PhaseError
        } else if self.mismatches().next().is_some() {
            ScenarioStatus::Mismatch
        } else if self.indeterminates().next().is_some() {
            ScenarioStatus::Indeterminate
        } else {
            ScenarioStatus::Passed
        };
    }

    /// True iff every cell matched its regime and no phase failed.
    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results
            .iter()
            .filter(|r| r.assessment == Assessment::Mismatch)
    }

    pub fn indeterminates(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.assessment, Assessment::Indeterminate(_)))
    }

    /// The cell for `(regime, path)`, if it was probed.
    pub fn result(&self, regime: Regime, path: TrafficPath) -> Option<&ProbeResult> {
        self.results
            .iter()
            .find(|r| r.regime == regime && r.path == path)
    }
}

/// Static description of one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub protocol: Protocol,
    pub namespace: String,
    pub workloads: ManifestRef,
    pub client: ReadinessPredicate,
    pub server: ReadinessPredicate,
    pub service_name: String,
    pub block_policy: PolicyObject,
    pub allow_policy: PolicyObject,
}

impl ScenarioSpec {
    /// The iperf3 client/server scenario with manifests from the assets root.
    pub fn policy_regimes(session: &ClusterSession, protocol: Protocol) -> Self {
        let namespace = session.namespace().to_string();
        Self {
            name: format!("{protocol}-policy-regimes"),
            protocol,
            namespace: namespace.clone(),
            workloads: ManifestRef::new("workloads", session.resolve_manifest(WORKLOADS_MANIFEST)),
            client: ReadinessPredicate::new(CLIENT_SELECTOR, 1),
            server: ReadinessPredicate::new(SERVER_SELECTOR, 1),
            service_name: SERVER_SERVICE.to_string(),
            block_policy: PolicyObject::new(
                ManifestRef::new("block_policy", session.resolve_manifest(BLOCK_POLICY_MANIFEST)),
                namespace.clone(),
                BLOCK_POLICY_NAME,
            ),
            allow_policy: PolicyObject::new(
                ManifestRef::new("allow_policy", session.resolve_manifest(ALLOW_POLICY_MANIFEST)),
                namespace,
                ALLOW_POLICY_NAME,
            ),
        }
    }
}

/// Runs scenarios against a shared session.
#[derive(Debug)]
pub struct ScenarioRunner<'a> {
    session: &'a ClusterSession,
    config: &'a HarnessConfig,
    audit_rules: AuditRules,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        session: &'a ClusterSession,
        config: &'a HarnessConfig,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            session,
            config,
            audit_rules: AuditRules::new(&config.audit_benign_patterns)?,
        })
    }

    pub fn session(&self) -> &'a ClusterSession {
        self.session
    }

    pub fn config(&self) -> &'a HarnessConfig {
        self.config
    }

    /// Run `spec` to completion. Never returns early without tearing down.
    #[instrument(skip_all, name = "harness.scenario.run", fields(scenario = %spec.name))]
    pub async fn run(&self, spec: &ScenarioSpec) -> ScenarioVerdict {
        let mut run = ScenarioRun {
            session: self.session,
            config: self.config,
            spec,
            ledger: ResourceLedger::new(),
            policies: PolicyManager::new(self.session)
                .with_acknowledgement(self.config.policy_ack.clone()),
            lifecycle: Lifecycle::new(),
            verdict: ScenarioVerdict::new(spec),
            denied_destinations: Vec::new(),
        };
        info!(
            target: "harness.scenario",
            run_id = %run.verdict.run_id,
            protocol = %spec.protocol,
            namespace = %spec.namespace,
            "Scenario starting"
        );

        if !self.config.platform.supports(spec.protocol) {
            let reason = format!(
                "{:?} nodes lack kernel support for {}",
                self.config.platform, spec.protocol
            );
            info!(target: "harness.scenario", reason = %reason, "Scenario skipped");
            run.verdict.skip_reason = Some(reason);
            run.lifecycle.advance(ScenarioState::Done);
            return run.finish();
        }

        let started = Instant::now();
        if let Err(e) = run.drive().await {
            error!(
                target: "harness.scenario",
                state = ?run.lifecycle.state,
                kind = e.kind(),
                error = %e,
                "Scenario phase failed"
            );
            run.verdict.phase_error = Some(PhaseFailure {
                state: run.lifecycle.state,
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            run.lifecycle.advance(ScenarioState::Failed);
            run.capture_diagnostics(e.kind()).await;
        }

        run.lifecycle.advance(ScenarioState::Teardown);
        run.teardown().await;

        let window = LogWindow {
            since: started.elapsed() + AUDIT_WINDOW_MARGIN,
            expected_denials: std::mem::take(&mut run.denied_destinations),
        };
        let auditor = HealthAuditor::new(
            self.session,
            self.config.audit_namespace.clone(),
            self.config.audit_selector.clone(),
            self.audit_rules.clone(),
        );
        match auditor.audit(&window).await {
            Ok(anomalies) => run.verdict.anomalies = anomalies,
            Err(e) => {
                warn!(target: "harness.scenario", error = %e, "Health audit could not run");
                run.verdict.warnings.push(format!("health audit skipped: {e}"));
            }
        }

        run.lifecycle.advance(ScenarioState::Done);
        let verdict = run.finish();
        info!(
            target: "harness.scenario",
            status = ?verdict.status,
            mismatches = verdict.mismatches().count(),
            indeterminate = verdict.indeterminates().count(),
            warnings = verdict.warnings.len(),
            anomalies = verdict.anomalies.len(),
            "Scenario finished"
        );
        verdict
    }
}

/// Mutable state of one scenario execution.
struct ScenarioRun<'a> {
    session: &'a ClusterSession,
    config: &'a HarnessConfig,
    spec: &'a ScenarioSpec,
    ledger: ResourceLedger,
    policies: PolicyManager<'a>,
    lifecycle: Lifecycle,
    verdict: ScenarioVerdict,
    /// Destinations probed under a blocking regime, for the audit.
    denied_destinations: Vec<String>,
}

/// Errors that make further probing pointless.
fn aborts_scenario(err: &HarnessError) -> bool {
    matches!(err, HarnessError::NotReady { .. } | HarnessError::Session(_))
}

impl<'a> ScenarioRun<'a> {
    async fn drive(&mut self) -> Result<()> {
        let spec = self.spec;
        let controller = ManifestController::new(self.session);
        let workloads = controller
            .apply(
                &mut self.ledger,
                &spec.workloads,
                &[spec.client.clone(), spec.server.clone()],
            )
            .await?;
        let [mut client, mut server]: [Workload; 2] = workloads.try_into().map_err(|_| {
            HarnessError::Session("workload manifest must yield a client and a server".to_string())
        })?;

        controller
            .wait_ready(&mut server, self.config.ready_timeout)
            .await?;
        controller
            .wait_ready(&mut client, self.config.ready_timeout)
            .await?;
        self.lifecycle.advance(ScenarioState::WorkloadsReady);

        let executor = ProbeExecutor::new(
            self.session,
            self.config.probe.clone(),
            spec.protocol,
            self.config.probe_concurrency,
        );

        self.probe_regime(&executor, Regime::None, None, &client, &server)
            .await?;
        self.lifecycle.advance(ScenarioState::RegimeNoneProbed);

        let transitions = [
            (
                Regime::Block,
                &spec.block_policy,
                ScenarioState::RegimeBlockApplied,
                ScenarioState::RegimeBlockProbed,
            ),
            (
                Regime::Allow,
                &spec.allow_policy,
                ScenarioState::RegimeAllowApplied,
                ScenarioState::RegimeAllowProbed,
            ),
        ];

        let mut prior = Regime::None;
        for (regime, policy, applied, probed) in transitions {
            let transition = self
                .policies
                .replace_policy(policy, self.config.policy_timeout)
                .await?;
            self.lifecycle.advance(applied);

            let window = ConvergenceWindow {
                prior_outcome: prior.expected(),
                acknowledged_at: transition.acknowledged_at,
                grace: self.session.poll_interval(),
            };
            self.probe_regime(&executor, regime, Some(window), &client, &server)
                .await?;
            self.lifecycle.advance(probed);
            prior = regime;
        }
        Ok(())
    }

    /// Probe every traffic path under `regime` and record the cells.
    #[instrument(skip_all, name = "harness.scenario.probe_regime", fields(regime = %regime))]
    async fn probe_regime(
        &mut self,
        executor: &ProbeExecutor<'_>,
        regime: Regime,
        window: Option<ConvergenceWindow>,
        client: &Workload,
        server: &Workload,
    ) -> Result<()> {
        let mut cells = Vec::with_capacity(TrafficPath::ALL.len());
        let mut requests = Vec::with_capacity(TrafficPath::ALL.len());

        // Destinations are resolved now; pod addresses change across redeploys
        for path in TrafficPath::ALL {
            match executor
                .resolve_destination(path, server, &self.spec.service_name)
                .await
            {
                Ok(destination) => requests.push(ProbeRequest {
                    path,
                    source: client,
                    destination,
                }),
                Err(e) if aborts_scenario(&e) => return Err(e),
                Err(e) => cells.push(ProbeResult::unresolved(regime, path, &e)),
            }
        }

        if regime.expected() == Outcome::Blocked {
            self.denied_destinations
                .extend(requests.iter().map(|r| r.destination.to_string()));
        }

        let attempts = executor.probe_all(&requests).await;
        for (request, attempt) in requests.iter().zip(attempts) {
            match attempt {
                Ok(evidence) => {
                    cells.push(
                        self.settle(executor, regime, window.as_ref(), client, server, evidence)
                            .await?,
                    );
                }
                Err(e) if aborts_scenario(&e) => return Err(e),
                Err(e) => cells.push(ProbeResult::unresolved(regime, request.path, &e)),
            }
        }

        cells.sort_by_key(|cell| cell.path as u8);
        let any_failed = cells.iter().any(|cell| !cell.passed());
        for cell in cells {
            log_cell(&cell);
            self.verdict.results.push(cell);
        }

        if any_failed {
            self.capture_diagnostics(regime.as_str()).await;
        }
        Ok(())
    }

    /// Assess `evidence`, re-probing after the convergence window closes when
    /// the first attempt still saw the previous regime. The destination is
    /// resolved again for every re-probe.
    async fn settle(
        &mut self,
        executor: &ProbeExecutor<'_>,
        regime: Regime,
        window: Option<&ConvergenceWindow>,
        client: &Workload,
        server: &Workload,
        mut evidence: ProbeEvidence,
    ) -> Result<ProbeResult> {
        let expected = regime.expected();
        let mut superseded = Vec::new();
        let mut reprobes_left = self.config.convergence_reprobes;

        loop {
            let assessment = assess(expected, evidence.outcome, evidence.started, window);
            let lagging =
                assessment == Assessment::Indeterminate(IndeterminateReason::ConvergenceLag);

            let Some(window) = window.filter(|_| lagging && reprobes_left > 0) else {
                return Ok(ProbeResult::observed(regime, assessment, evidence, superseded));
            };
            reprobes_left -= 1;

            info!(
                target: "harness.scenario",
                regime = %regime,
                path = %evidence.path,
                observed = %evidence.outcome,
                "Pre-transition outcome inside convergence window, re-probing"
            );
            tokio::time::sleep_until(window.closes_at()).await;

            let next = match executor
                .resolve_destination(evidence.path, server, &self.spec.service_name)
                .await
            {
                Ok(destination) => {
                    let denied = destination.to_string();
                    if expected == Outcome::Blocked && !self.denied_destinations.contains(&denied) {
                        self.denied_destinations.push(denied);
                    }
                    executor.probe(evidence.path, client, &destination).await
                }
                Err(e) => Err(e),
            };
            match next {
                Ok(next) => superseded.push(std::mem::replace(&mut evidence, next)),
                Err(e) if aborts_scenario(&e) => return Err(e),
                Err(e) => {
                    let mut cell = ProbeResult::observed(regime, assessment, evidence, superseded);
                    cell.error = Some(format!("re-probe failed: {e}"));
                    return Ok(cell);
                }
            }
        }
    }

    /// Capture diagnostics once per scenario, at the first failure.
    async fn capture_diagnostics(&mut self, reason: &str) {
        if !self.verdict.diagnostics.is_empty() {
            return;
        }
        let plan = DiagnosticsPlan {
            namespace: self.spec.namespace.clone(),
            agent_namespace: self.config.audit_namespace.clone(),
            agent_selector: self.config.audit_selector.clone(),
            agent_commands: self.config.agent_report_commands.clone(),
        };
        self.verdict.diagnostics = diagnostics::capture(self.session, &plan, reason).await;
    }

    /// Remove policies, release workloads, then wait for termination.
    #[instrument(skip_all, name = "harness.scenario.teardown")]
    async fn teardown(&mut self) {
        let controller = ManifestController::new(self.session);

        let mut failures = self.policies.remove_all().await;
        let selectors = self.ledger.selectors().to_vec();
        failures.extend(controller.release(&mut self.ledger).await);

        if !selectors.is_empty() {
            if let Err(e) = controller
                .wait_all_terminated(&self.spec.namespace, &selectors, self.config.terminate_timeout)
                .await
            {
                failures.push(e);
            }
        }

        for failure in &failures {
            warn!(
                target: "harness.scenario",
                kind = failure.kind(),
                error = %failure,
                "Teardown incomplete"
            );
        }
        self.verdict
            .warnings
            .extend(failures.iter().map(ToString::to_string));
    }

    fn finish(self) -> ScenarioVerdict {
        let ScenarioRun {
            lifecycle,
            mut verdict,
            ..
        } = self;
        verdict.finish(lifecycle.history);
        verdict
    }
}

fn log_cell(cell: &ProbeResult) {
    match cell.to_error() {
        None => info!(
            target: "harness.scenario",
            regime = %cell.regime,
            path = %cell.path,
            outcome = %cell.observed,
            "Probe passed"
        ),
        Some(err @ HarnessError::ProbeMismatch { .. }) => error!(
            target: "harness.scenario",
            regime = %cell.regime,
            path = %cell.path,
            error = %err,
            "Probe mismatch"
        ),
        Some(err) => warn!(
            target: "harness.scenario",
            regime = %cell.regime,
            path = %cell.path,
            error = %err,
            "Probe indeterminate"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_table() {
        let table: Vec<(Regime, Outcome)> =
            Regime::SEQUENCE.iter().map(|r| (*r, r.expected())).collect();
        assert_eq!(
            table,
            vec![
                (Regime::None, Outcome::Allowed),
                (Regime::Block, Outcome::Blocked),
                (Regime::Allow, Outcome::Allowed),
            ]
        );
    }

    #[test]
    fn test_happy_path_transitions_are_legal() {
        use ScenarioState::*;
        let path = [
            Init,
            WorkloadsReady,
            RegimeNoneProbed,
            RegimeBlockApplied,
            RegimeBlockProbed,
            RegimeAllowApplied,
            RegimeAllowProbed,
            Teardown,
            Done,
        ];
        for pair in path.windows(2) {
            if let [from, to] = pair {
                assert!(from.can_advance_to(*to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_failure_routes_through_teardown() {
        use ScenarioState::*;
        assert!(RegimeBlockApplied.can_advance_to(Failed));
        assert!(Init.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Teardown));
        assert!(!Failed.can_advance_to(Done));
        assert!(!Teardown.can_advance_to(Failed));
        assert!(!RegimeNoneProbed.can_advance_to(RegimeAllowApplied));
    }

    #[test]
    fn test_status_severity_orders_phase_errors_first() {
        assert!(ScenarioStatus::PhaseError.severity() > ScenarioStatus::Mismatch.severity());
        assert!(ScenarioStatus::Mismatch.severity() > ScenarioStatus::Indeterminate.severity());
        assert_eq!(
            ScenarioStatus::Skipped.severity(),
            ScenarioStatus::Passed.severity()
        );
    }

    #[test]
    fn test_unresolved_cell_is_indeterminate() {
        let err = HarnessError::Indeterminate {
            path: "pod-to-pod".to_string(),
            reason: "no ready pod with an address for app=iperf3-server".to_string(),
        };
        let cell = ProbeResult::unresolved(Regime::Block, TrafficPath::PodToPod, &err);

        assert!(!cell.passed());
        assert_eq!(cell.expected, Outcome::Blocked);
        assert_eq!(cell.observed, Outcome::Error);
        assert!(matches!(
            cell.to_error(),
            Some(HarnessError::Indeterminate { reason, .. }) if reason.contains("no ready pod")
        ));
    }
}
