//! Live-cluster suite.
//!
//! Runs the full none → block → allow scenario against the cluster selected
//! by the current kubectl context. Requires a kind cluster with the
//! enforcement layer installed and SCTP enabled on the nodes:
//!
//! ```bash
//! HARNESS_ASSETS_ROOT=$PWD/manifests/sctp cargo test -p policy-harness --features live-cluster
//! ```
//!
//! Tests share the cluster namespace, so they run serially.

#![cfg(feature = "live-cluster")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use policy_harness::config::HarnessConfig;
use policy_harness::kubectl::Kubectl;
use policy_harness::scenario::{ScenarioRunner, ScenarioSpec, ScenarioStatus};
use policy_harness::session::{ClusterSession, SessionOptions};
use policy_harness::suite::Suite;
use serial_test::serial;
use std::sync::Arc;

async fn live_session(config: &HarnessConfig) -> ClusterSession {
    let kubectl = Kubectl::new(
        config.kubectl.clone(),
        config.kube_context.clone(),
        config.command_timeout,
    );
    ClusterSession::connect(
        Arc::new(kubectl),
        SessionOptions {
            context: config.kube_context.clone(),
            namespace: config.namespace.clone(),
            assets_root: config.assets_root.clone(),
            command_timeout: config.command_timeout,
            poll_interval: config.poll_interval,
        },
    )
    .await
    .expect("Failed to connect to cluster - check the kubectl context")
}

#[tokio::test]
#[serial]
async fn test_cluster_session_connects() {
    let config = HarnessConfig::from_env().expect("valid HARNESS_* environment");
    let session = live_session(&config).await;

    let agents = session
        .pod_names(&config.audit_namespace, &config.audit_selector)
        .await
        .expect("agent pods should be listable");
    assert!(
        !agents.is_empty(),
        "no enforcement agent pods match {} in {}",
        config.audit_selector,
        config.audit_namespace
    );
    session.close();
}

#[tokio::test]
#[serial]
async fn test_policy_regimes_on_live_cluster() {
    let config = HarnessConfig::from_env().expect("valid HARNESS_* environment");
    let session = live_session(&config).await;
    let runner = ScenarioRunner::new(&session, &config).expect("valid audit rules");

    let report = Suite::new(runner)
        .run(&[ScenarioSpec::policy_regimes(&session, config.protocol)])
        .await;
    session.close();

    let verdict = &report.scenarios[0];
    if verdict.status == ScenarioStatus::Skipped {
        eprintln!("skipped: {:?}", verdict.skip_reason);
        return;
    }
    assert!(verdict.passed(), "verdict: {verdict:#?}");
    for warning in report.warnings() {
        eprintln!("warning: {warning}");
    }
}
