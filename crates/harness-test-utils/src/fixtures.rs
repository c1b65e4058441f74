//! Sessions and configuration wired to a [`FakeCluster`].

use crate::fake_cluster::FakeCluster;
use policy_harness::config::HarnessConfig;
use policy_harness::session::{ClusterSession, SessionOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration with short waits suited to paused-time tests.
#[must_use]
pub fn fake_config() -> HarnessConfig {
    HarnessConfig {
        namespace: "default".to_string(),
        assets_root: PathBuf::from("manifests/sctp"),
        command_timeout: Duration::from_secs(10),
        ready_timeout: Duration::from_secs(30),
        policy_timeout: Duration::from_secs(30),
        terminate_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(1),
        ..HarnessConfig::default()
    }
}

/// Open a session on `cluster` using `config`.
pub async fn session_with(cluster: &FakeCluster, config: &HarnessConfig) -> ClusterSession {
    ClusterSession::connect(
        Arc::new(cluster.clone()),
        SessionOptions {
            context: Some("fake".to_string()),
            namespace: config.namespace.clone(),
            assets_root: config.assets_root.clone(),
            command_timeout: config.command_timeout,
            poll_interval: config.poll_interval,
        },
    )
    .await
    .expect("fake cluster session should connect")
}

/// Open a session on `cluster` with [`fake_config`].
pub async fn fake_session(cluster: &FakeCluster) -> (ClusterSession, HarnessConfig) {
    let config = fake_config();
    let session = session_with(cluster, &config).await;
    (session, config)
}
