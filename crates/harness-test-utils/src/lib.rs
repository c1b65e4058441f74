//! # Harness Test Utilities
//!
//! In-memory stand-ins for the cluster, so the scenario runner can be
//! exercised end to end without kubectl or a live cluster.
//!
//! ## Modules
//!
//! - `fake_cluster` - `FakeCluster`, a `ControlPlane` with fault injection
//! - `fixtures` - sessions and configs wired to a `FakeCluster`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harness_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let cluster = FakeCluster::new().with_enforcement_lag(1);
//!     let (session, config) = fake_session(&cluster).await;
//!
//!     let runner = ScenarioRunner::new(&session, &config).unwrap();
//!     let verdict = runner.run(&ScenarioSpec::policy_regimes(&session, Protocol::Sctp)).await;
//!
//!     assert!(verdict.passed());
//!     assert!(cluster.is_clean());
//! }
//! ```

pub mod fake_cluster;
pub mod fixtures;

pub use fake_cluster::*;
pub use fixtures::*;
