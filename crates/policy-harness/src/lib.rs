//! Network Policy Conformance Harness
//!
//! Proves that a cluster's network-policy enforcement layer handles a given
//! transport protocol (SCTP by default) correctly. A client/server workload
//! pair is deployed, and pod-to-pod plus pod-to-service traffic is probed
//! under three successive regimes:
//!
//! | Regime | Expected |
//! |--------|----------|
//! | none   | ALLOWED  |
//! | block  | BLOCKED  |
//! | allow  | ALLOWED  |
//!
//! Every scenario tears down what it created, whichever phase failed, and
//! waits for its pods to terminate before the next scenario starts.
//!
//! # Prerequisites
//!
//! 1. A multi-node cluster with the enforcement agent installed (e.g. kind + Cilium)
//! 2. `kubectl` in PATH with a context pointing at that cluster
//! 3. The manifests under `manifests/sctp/` (or `HARNESS_ASSETS_ROOT`)
//!
//! # Usage
//!
//! ```bash
//! # Run the suite against the current kubectl context
//! cargo run -p policy-harness
//!
//! # Offline tests against the in-memory control plane
//! cargo test -p policy-harness
//!
//! # Live-cluster tests
//! cargo test -p policy-harness --features live-cluster
//! ```

pub mod audit;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod eventual;
pub mod kubectl;
pub mod manifest;
pub mod policy;
pub mod probe;
pub mod scenario;
pub mod session;
pub mod suite;
