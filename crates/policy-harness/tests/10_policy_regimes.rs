//! Offline end-to-end tests: the literal none → block → allow scenario.
//!
//! Runs the full scenario runner against the in-memory control plane, with
//! paused time so readiness, convergence and termination waits are instant.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use harness_test_utils::{fake_config, fake_session, session_with, FakeCluster};
use policy_harness::config::Platform;
use policy_harness::probe::{
    Assessment, EndpointRef, IndeterminateReason, Outcome, Protocol, TrafficPath,
};
use policy_harness::scenario::{Regime, ScenarioRunner, ScenarioSpec, ScenarioState, ScenarioStatus};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_literal_scenario_matches_expected_table() {
    let cluster = FakeCluster::new();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).expect("valid audit rules");

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert!(verdict.passed(), "scenario should pass: {verdict:#?}");
    assert_eq!(verdict.results.len(), 6);
    for regime in Regime::SEQUENCE {
        for path in TrafficPath::ALL {
            let cell = verdict
                .result(regime, path)
                .unwrap_or_else(|| panic!("missing cell {regime}/{path}"));
            assert_eq!(cell.observed, regime.expected(), "{regime}/{path}");
            assert_eq!(cell.assessment, Assessment::Passed);
            assert!(cell.superseded.is_empty());
        }
    }

    assert_eq!(
        verdict.history,
        vec![
            ScenarioState::Init,
            ScenarioState::WorkloadsReady,
            ScenarioState::RegimeNoneProbed,
            ScenarioState::RegimeBlockApplied,
            ScenarioState::RegimeBlockProbed,
            ScenarioState::RegimeAllowApplied,
            ScenarioState::RegimeAllowProbed,
            ScenarioState::Teardown,
            ScenarioState::Done,
        ]
    );
    assert!(verdict.warnings.is_empty(), "{:?}", verdict.warnings);
    assert!(verdict.diagnostics.is_empty());
    assert!(cluster.is_clean(), "leaked: {:?} {:?}", cluster.live_pods(), cluster.live_policies());
}

#[tokio::test(start_paused = true)]
async fn test_probes_use_traffic_generator_invocation() {
    let cluster = FakeCluster::new();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    let execs = cluster.calls_matching("exec iperf3-client");
    assert_eq!(execs.len(), 6);
    assert!(execs
        .iter()
        .any(|c| c.ends_with("timeout 5 iperf3 -i 1 -t 3 --sctp -c 10.244.2.7")));
    assert!(execs
        .iter()
        .any(|c| c.ends_with("timeout 5 iperf3 -i 1 -t 3 --sctp -c iperf3-server")));
}

#[tokio::test(start_paused = true)]
async fn test_block_policy_is_removed_before_allow_is_applied() {
    let cluster = FakeCluster::new();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    let calls = cluster.calls();
    let position = |needle: &str| {
        calls
            .iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("{needle} never called"))
    };
    assert!(position("delete policy-no-sctp.yaml") < position("apply policy-allow-sctp.yaml"));
}

#[tokio::test(start_paused = true)]
async fn test_convergence_lag_is_reprobed_not_failed() {
    let cluster = FakeCluster::new().with_enforcement_lag(1);
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert!(verdict.passed(), "{verdict:#?}");

    let block = verdict.result(Regime::Block, TrafficPath::PodToPod).unwrap();
    assert_eq!(block.observed, Outcome::Blocked);
    assert_eq!(block.superseded.len(), 1);
    assert_eq!(block.superseded[0].outcome, Outcome::Allowed);

    let allow = verdict.result(Regime::Allow, TrafficPath::PodToPod).unwrap();
    assert_eq!(allow.observed, Outcome::Allowed);
    assert_eq!(allow.superseded.len(), 1);
    assert_eq!(allow.superseded[0].outcome, Outcome::Blocked);
}

#[tokio::test(start_paused = true)]
async fn test_reprobe_follows_restarted_server() {
    // The server comes back at a new address right after the first block-regime
    // attempt, which still saw the previous regime
    let cluster = FakeCluster::new()
        .with_enforcement_lag(1)
        .with_workload_restart("app=iperf3-server", 3, [10, 244, 2, 8]);
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert!(verdict.passed(), "{verdict:#?}");
    let moved = EndpointRef::PodIp("10.244.2.8".parse().unwrap());

    let block = verdict.result(Regime::Block, TrafficPath::PodToPod).unwrap();
    assert_eq!(block.observed, Outcome::Blocked);
    assert!(block.error.is_none(), "{:?}", block.error);
    assert_eq!(block.evidence.as_ref().unwrap().destination, moved);
    assert_eq!(block.superseded.len(), 1);
    assert_eq!(
        block.superseded[0].destination,
        EndpointRef::PodIp("10.244.2.7".parse().unwrap())
    );

    let allow = verdict.result(Regime::Allow, TrafficPath::PodToPod).unwrap();
    assert_eq!(allow.evidence.as_ref().unwrap().destination, moved);
    assert!(cluster
        .calls_matching("exec iperf3-client")
        .iter()
        .any(|c| c.ends_with("-c 10.244.2.8")));
}

#[tokio::test(start_paused = true)]
async fn test_agents_acknowledge_policies_without_object_status() {
    let cluster = FakeCluster::new().without_object_status();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert!(verdict.passed(), "{verdict:#?}");
    assert!(cluster.calls_matching("status ").is_empty());
    // Programming and removal of both policies, each confirmed by revision
    assert!(cluster.calls_matching("exec cilium-x7k2p cilium-dbg policy get").len() >= 4);
    assert!(cluster.calls_matching("exec cilium-x7k2p cilium-dbg policy wait").len() >= 4);
    assert!(cluster.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_object_status_backs_up_agents_without_cli() {
    let cluster = FakeCluster::new().without_agent_cli();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert!(verdict.passed(), "{verdict:#?}");
    assert!(!cluster.calls_matching("status sctp-deny").is_empty());
    assert!(!cluster.calls_matching("status sctp-allow").is_empty());
    assert!(cluster.calls_matching("exec cilium-x7k2p cilium-dbg policy wait").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_convergence_lag_without_reprobe_is_indeterminate() {
    let cluster = FakeCluster::new().with_enforcement_lag(1);
    let config = harness_test_utils::fake_config();
    let config = policy_harness::config::HarnessConfig {
        convergence_reprobes: 0,
        ..config
    };
    let session = session_with(&cluster, &config).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert_eq!(verdict.status, ScenarioStatus::Indeterminate);
    assert_eq!(verdict.mismatches().count(), 0);
    let block = verdict.result(Regime::Block, TrafficPath::PodToPod).unwrap();
    assert_eq!(
        block.assessment,
        Assessment::Indeterminate(IndeterminateReason::ConvergenceLag)
    );
    assert!(cluster.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_enforcement_failure_after_window_is_mismatch() {
    // Lag outlasts the re-probe: the policy really is not enforced
    let cluster = FakeCluster::new().with_enforcement_lag(10);
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert_eq!(verdict.status, ScenarioStatus::Mismatch);
    let block = verdict.result(Regime::Block, TrafficPath::PodToPod).unwrap();
    assert_eq!(block.assessment, Assessment::Mismatch);
    assert_eq!(block.observed, Outcome::Allowed);
    assert!(block.to_error().is_some());
    // Mismatches do not stop the scenario
    assert_eq!(verdict.results.len(), 6);
    assert_eq!(verdict.history.last(), Some(&ScenarioState::Done));
    assert!(!verdict.diagnostics.is_empty());
    assert!(cluster.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_missing_probe_binary_is_indeterminate() {
    let cluster = FakeCluster::new().with_missing_probe_binary();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert_eq!(verdict.status, ScenarioStatus::Indeterminate);
    assert_eq!(verdict.mismatches().count(), 0);
    assert!(verdict.results.iter().all(|r| r.observed == Outcome::Error
        && r.assessment == Assessment::Indeterminate(IndeterminateReason::ToolFailure)));
    assert!(cluster.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_missing_kernel_support_is_indeterminate() {
    let cluster = FakeCluster::new().with_protocol_unsupported();
    let (session, config) = fake_session(&cluster).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert_eq!(verdict.status, ScenarioStatus::Indeterminate);
    assert_eq!(verdict.indeterminates().count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_gke_skips_sctp_without_touching_cluster() {
    let cluster = FakeCluster::new();
    let config = policy_harness::config::HarnessConfig {
        platform: Platform::Gke,
        ..fake_config()
    };
    let session = session_with(&cluster, &config).await;
    let runner = ScenarioRunner::new(&session, &config).unwrap();

    let verdict = runner
        .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
        .await;

    assert_eq!(verdict.status, ScenarioStatus::Skipped);
    assert!(verdict.skip_reason.is_some());
    assert!(verdict.results.is_empty());
    assert_eq!(verdict.history, vec![ScenarioState::Init, ScenarioState::Done]);
    assert_eq!(cluster.calls(), vec!["cluster-info".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_probe_concurrency_is_bounded() {
    for concurrency in [1, 2] {
        let cluster = FakeCluster::new().with_exec_latency(Duration::from_secs(2));
        let config = policy_harness::config::HarnessConfig {
            probe_concurrency: concurrency,
            ..fake_config()
        };
        let session = session_with(&cluster, &config).await;
        let runner = ScenarioRunner::new(&session, &config).unwrap();

        let verdict = runner
            .run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp))
            .await;

        assert!(verdict.passed(), "concurrency {concurrency}: {verdict:#?}");
        assert_eq!(cluster.max_concurrent_execs(), concurrency);
    }
}
