//! Manifest lifecycle: apply, wait for readiness, delete, confirm termination.
//!
//! # Scoped teardown
//!
//! Every manifest is recorded in a [`ResourceLedger`] *before* it is
//! submitted, so resources created by a partially-failed apply are still
//! released. [`ManifestController::release`] deletes everything the ledger
//! holds, newest first, and is called on every exit path of a scenario.
//! Deletion is idempotent: a manifest whose objects are already gone is not
//! an error.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::errors::{HarnessError, Result};
use crate::eventual::{retry_until, RetryPolicy, WaitKind};
use crate::session::ClusterSession;

/// A declarative manifest, keyed by logical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRef {
    /// Logical name used in logs and reports (e.g. "workloads").
    pub name: String,
    pub path: PathBuf,
}

impl ManifestRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Readiness predicate for one workload in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessPredicate {
    pub selector: String,
    pub expected_replicas: usize,
}

impl ReadinessPredicate {
    pub fn new(selector: impl Into<String>, expected_replicas: usize) -> Self {
        Self {
            selector: selector.into(),
            expected_replicas,
        }
    }
}

/// A deployed workload, identified by its label selector.
///
/// Only [`ManifestController::wait_ready`] marks a workload ready; probes
/// refuse workloads that are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    manifest: ManifestRef,
    namespace: String,
    readiness: ReadinessPredicate,
    ready: bool,
}

impl Workload {
    pub fn manifest(&self) -> &ManifestRef {
        &self.manifest
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn selector(&self) -> &str {
        &self.readiness.selector
    }

    pub fn readiness(&self) -> &ReadinessPredicate {
        &self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Fail with `NotReady` unless readiness has been confirmed.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(HarnessError::NotReady {
                selector: self.readiness.selector.clone(),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    manifest: ManifestRef,
    namespace: String,
}

/// Manifests applied during one scenario that must be released.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<LedgerEntry>,
    /// Selectors of every workload created, for the termination barrier.
    selectors: Vec<String>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, manifest: &ManifestRef, namespace: &str) {
        let already = self
            .entries
            .iter()
            .any(|e| e.manifest == *manifest && e.namespace == namespace);
        if !already {
            self.entries.push(LedgerEntry {
                manifest: manifest.clone(),
                namespace: namespace.to_string(),
            });
        }
    }

    fn record_selector(&mut self, selector: &str) {
        if !self.selectors.iter().any(|s| s == selector) {
            self.selectors.push(selector.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Selectors of all workloads applied through this ledger.
    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            let names: Vec<&str> = self.entries.iter().map(|e| e.manifest.name.as_str()).collect();
            warn!(
                target: "harness.manifest",
                leaked = ?names,
                "Resource ledger dropped without release; cluster resources may be leaked"
            );
        }
    }
}

/// Applies and removes manifests on behalf of one scenario.
#[derive(Debug, Clone, Copy)]
pub struct ManifestController<'a> {
    session: &'a ClusterSession,
}

impl<'a> ManifestController<'a> {
    pub fn new(session: &'a ClusterSession) -> Self {
        Self { session }
    }

    /// Submit `manifest` and return one workload per readiness predicate.
    ///
    /// Re-applying an already-applied manifest is idempotent.
    #[instrument(skip_all, name = "harness.manifest.apply", fields(manifest = %manifest.name))]
    pub async fn apply(
        &self,
        ledger: &mut ResourceLedger,
        manifest: &ManifestRef,
        readiness: &[ReadinessPredicate],
    ) -> Result<Vec<Workload>> {
        let namespace = self.session.namespace().to_string();

        // Record first so a partially-applied manifest is still released
        ledger.record(manifest, &namespace);
        for predicate in readiness {
            ledger.record_selector(&predicate.selector);
        }

        let output = self
            .session
            .control_plane()?
            .apply(&manifest.path, &namespace)
            .await
            .map_err(|e| HarnessError::Apply {
                manifest: manifest.name.clone(),
                output: e.to_string(),
            })?;

        if !output.success() {
            return Err(HarnessError::Apply {
                manifest: manifest.name.clone(),
                output: output.combined_output(),
            });
        }

        info!(
            target: "harness.manifest",
            manifest = %manifest.name,
            namespace = %namespace,
            "Manifest applied"
        );

        Ok(readiness
            .iter()
            .map(|predicate| Workload {
                manifest: manifest.clone(),
                namespace: namespace.clone(),
                readiness: predicate.clone(),
                ready: false,
            })
            .collect())
    }

    /// Poll the workload's readiness predicate until satisfied or `timeout`.
    #[instrument(skip_all, name = "harness.manifest.wait_ready", fields(selector = %workload.selector()))]
    pub async fn wait_ready(&self, workload: &mut Workload, timeout: Duration) -> Result<()> {
        let pods = self
            .session
            .wait_ready(
                &workload.namespace,
                &workload.readiness.selector,
                workload.readiness.expected_replicas,
                timeout,
            )
            .await?;

        workload.ready = true;
        info!(
            target: "harness.manifest",
            selector = %workload.readiness.selector,
            ready_pods = pods.len(),
            "Workload ready"
        );
        Ok(())
    }

    /// Best-effort delete. Objects that are already absent are not an error.
    #[instrument(skip_all, name = "harness.manifest.delete", fields(manifest = %manifest.name))]
    pub async fn delete(&self, manifest: &ManifestRef, namespace: &str) -> Result<()> {
        let output = self
            .session
            .control_plane()?
            .delete(&manifest.path, namespace)
            .await
            .map_err(|e| HarnessError::Teardown {
                resource: manifest.name.clone(),
                output: e.to_string(),
            })?;

        if output.success() {
            debug!(target: "harness.manifest", manifest = %manifest.name, "Manifest deleted");
            return Ok(());
        }

        let combined = output.combined_output();
        if is_absent(&combined) {
            debug!(
                target: "harness.manifest",
                manifest = %manifest.name,
                "Manifest already absent"
            );
            return Ok(());
        }

        Err(HarnessError::Teardown {
            resource: manifest.name.clone(),
            output: combined,
        })
    }

    /// Delete everything recorded in `ledger`, newest first.
    ///
    /// Every entry is attempted even if earlier deletes fail; the failures
    /// are returned for the suite-level warning list.
    pub async fn release(&self, ledger: &mut ResourceLedger) -> Vec<HarnessError> {
        let mut failures = Vec::new();
        while let Some(entry) = ledger.entries.pop() {
            if let Err(e) = self.delete(&entry.manifest, &entry.namespace).await {
                warn!(
                    target: "harness.manifest",
                    manifest = %entry.manifest.name,
                    error = %e,
                    "Failed to release manifest"
                );
                failures.push(e);
            }
        }
        failures
    }

    /// Wait until no pod selected by `selectors` remains and nothing in the
    /// namespace is still terminating.
    #[instrument(skip_all, name = "harness.manifest.wait_all_terminated", fields(namespace = %namespace))]
    pub async fn wait_all_terminated(
        &self,
        namespace: &str,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<()> {
        let control_plane = self.session.control_plane()?;
        let policy = RetryPolicy::new(self.session.poll_interval(), timeout);

        retry_until(WaitKind::Termination, policy, move || async move {
            let mut remaining = Vec::new();
            for selector in selectors {
                let pods = control_plane
                    .list_pods(namespace, selector)
                    .await
                    .map_err(|e| format!("listing pods failed: {e}"))?;
                remaining.extend(pods.into_iter().map(|p| p.name));
            }

            let terminating: Vec<String> = control_plane
                .list_pods(namespace, "")
                .await
                .map_err(|e| format!("listing pods failed: {e}"))?
                .into_iter()
                .filter(|p| p.terminating)
                .map(|p| p.name)
                .collect();
            for name in terminating {
                if !remaining.contains(&name) {
                    remaining.push(name);
                }
            }

            if remaining.is_empty() {
                Ok(())
            } else {
                Err(format!("{} pods remaining: {}", remaining.len(), remaining.join(", ")))
            }
        })
        .await
        .map_err(|timeout| HarnessError::Timeout {
            what: format!("{} in {namespace}", timeout.kind.as_str()),
            waited: timeout.waited,
            last_observation: timeout.last_observation,
        })?;

        info!(target: "harness.manifest", namespace = %namespace, "All pods terminated");
        Ok(())
    }
}

fn is_absent(output: &str) -> bool {
    output.contains("NotFound") || output.contains("not found")
}
