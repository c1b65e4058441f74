//! Post-scenario health audit.
//!
//! Explicit probe assertions only catch what they look for. After each
//! scenario the enforcement agent logs covering the scenario's time window
//! are scanned for error-level entries, so that a crash loop or a failed
//! regeneration that happened not to flip a probe is still surfaced.
//! Findings are advisory: they never change a verdict.

use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::ConfigError;
use crate::errors::Result;
use crate::session::ClusterSession;

/// Built-in error signatures: (name, pattern).
const ERROR_SIGNATURES: &[(&str, &str)] = &[
    ("error-level", r"level=(?:error|fatal)\b"),
    ("panic", r"\bpanic:"),
    ("deadlock", r"(?i)\bdeadlock"),
    ("segfault", r"(?i)segmentation fault|SIGSEGV"),
    ("bug", r"\bBUG:"),
    ("unexpected-error", r"Unexpected error"),
];

/// Words that mark a log line as reporting a policy drop.
const DENIAL_KEYWORDS: &[&str] = &["Policy denied", "policy-denied", "POLICY_DENIED", "DROPPED"];

/// The slice of agent logs to scan.
#[derive(Debug, Clone, Default)]
pub struct LogWindow {
    /// How far back from now the scenario started.
    pub since: Duration,
    /// Destinations probed under a regime that expected BLOCKED; drop
    /// reports mentioning them are the policy working, not a fault.
    pub expected_denials: Vec<String>,
}

/// One unexplained error-level log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    /// `pod/<name>/<container>` the line came from, when prefixed.
    pub source: Option<String>,
    pub signature: String,
    pub line: String,
}

/// Compiled error signatures and benign exclusions.
#[derive(Debug, Clone)]
pub struct AuditRules {
    signatures: Vec<(String, Regex)>,
    benign: Vec<Regex>,
}

impl AuditRules {
    /// Compile the built-in signatures plus user-supplied benign patterns.
    pub fn new(benign_patterns: &[String]) -> std::result::Result<Self, ConfigError> {
        let signatures = ERROR_SIGNATURES
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|re| ((*name).to_string(), re))
                    .map_err(|e| ConfigError::InvalidValue(format!("signature {name}: {e}")))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let benign = benign_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::InvalidValue(format!("benign audit pattern {pattern:?}: {e}"))
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { signatures, benign })
    }

    /// Scan raw `kubectl logs --prefix` output.
    pub fn scan(&self, logs: &str, window: &LogWindow) -> Vec<Anomaly> {
        logs.lines()
            .filter_map(|raw| {
                let (source, line) = split_prefix(raw);
                let (signature, _) = self.signatures.iter().find(|(_, re)| re.is_match(line))?;
                if self.benign.iter().any(|re| re.is_match(line)) || is_expected_denial(line, window)
                {
                    return None;
                }
                Some(Anomaly {
                    source: source.map(str::to_string),
                    signature: signature.clone(),
                    line: line.to_string(),
                })
            })
            .collect()
    }
}

/// Split `[pod/name/container] message` into its parts.
fn split_prefix(raw: &str) -> (Option<&str>, &str) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((source, line)) = rest.split_once("] ") {
            return (Some(source), line);
        }
    }
    (None, raw)
}

fn is_expected_denial(line: &str, window: &LogWindow) -> bool {
    DENIAL_KEYWORDS.iter().any(|k| line.contains(k))
        && window
            .expected_denials
            .iter()
            .any(|destination| line.contains(destination.as_str()))
}

/// Scans enforcement agent logs after a scenario.
#[derive(Debug, Clone)]
pub struct HealthAuditor<'a> {
    session: &'a ClusterSession,
    namespace: String,
    selector: String,
    rules: AuditRules,
}

impl<'a> HealthAuditor<'a> {
    pub fn new(
        session: &'a ClusterSession,
        namespace: impl Into<String>,
        selector: impl Into<String>,
        rules: AuditRules,
    ) -> Self {
        Self {
            session,
            namespace: namespace.into(),
            selector: selector.into(),
            rules,
        }
    }

    /// Return error-level entries in `window` not explained by expected drops.
    #[instrument(skip_all, name = "harness.audit", fields(selector = %self.selector))]
    pub async fn audit(&self, window: &LogWindow) -> Result<Vec<Anomaly>> {
        let logs = self
            .session
            .control_plane()?
            .logs(&self.namespace, &self.selector, window.since)
            .await?;

        let anomalies = self.rules.scan(&logs, window);
        if anomalies.is_empty() {
            info!(target: "harness.audit", "No anomalies in agent logs");
        } else {
            for anomaly in &anomalies {
                warn!(
                    target: "harness.audit",
                    source = anomaly.source.as_deref().unwrap_or("-"),
                    signature = %anomaly.signature,
                    line = %anomaly.line,
                    "Latent error in agent logs"
                );
            }
        }
        Ok(anomalies)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const LOGS: &str = "\
[pod/cilium-x7k2p/cilium-agent] level=info msg=\"Policy imported\" policyRevision=12
[pod/cilium-x7k2p/cilium-agent] level=error msg=\"Failed to regenerate endpoint\" endpointID=311
[pod/cilium-x7k2p/cilium-agent] level=warning msg=\"Unable to update ipcache\"
[pod/cilium-9qz4m/cilium-agent] level=error msg=\"Policy denied\" dst=10.0.1.17 proto=SCTP
[pod/cilium-9qz4m/cilium-agent] panic: runtime error: invalid memory address
unprefixed line with segmentation fault
";

    fn window() -> LogWindow {
        LogWindow {
            since: Duration::from_secs(120),
            expected_denials: vec!["10.0.1.17".to_string()],
        }
    }

    #[test]
    fn test_scan_reports_unexplained_errors() {
        let rules = AuditRules::new(&[]).unwrap();
        let anomalies = rules.scan(LOGS, &window());

        assert_eq!(anomalies.len(), 3);
        assert_eq!(anomalies[0].signature, "error-level");
        assert_eq!(anomalies[0].source.as_deref(), Some("pod/cilium-x7k2p/cilium-agent"));
        assert_eq!(anomalies[1].signature, "panic");
        assert_eq!(anomalies[2].signature, "segfault");
        assert_eq!(anomalies[2].source, None);
    }

    #[test]
    fn test_expected_denial_is_not_an_anomaly() {
        let rules = AuditRules::new(&[]).unwrap();
        let anomalies = rules.scan(LOGS, &window());
        assert!(anomalies.iter().all(|a| !a.line.contains("Policy denied")));

        // Without the blocked destination the same drop is reported
        let anomalies = rules.scan(LOGS, &LogWindow::default());
        assert!(anomalies.iter().any(|a| a.line.contains("Policy denied")));
    }

    #[test]
    fn test_benign_patterns_are_excluded() {
        let rules = AuditRules::new(&["Failed to regenerate endpoint".to_string()]).unwrap();
        let anomalies = rules.scan(LOGS, &window());
        assert_eq!(anomalies.len(), 2);
    }

    #[test]
    fn test_invalid_benign_pattern_is_rejected() {
        let err = AuditRules::new(&["(unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
