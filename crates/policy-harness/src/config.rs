//! Harness configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default tuned for a local kind cluster running Cilium; a variable that is
//! present but unparseable is an error rather than a silent fallback.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::policy::{Acknowledgement, DEFAULT_AGENT_CLI};
use crate::probe::{ProbeSpec, Protocol};

/// Default kubectl binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default namespace the workload pair is deployed into.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default directory holding the workload and policy manifests.
pub const DEFAULT_ASSETS_ROOT: &str = "manifests/sctp";

/// Default per-command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 60;

/// Default readiness wait in seconds.
pub const DEFAULT_READY_TIMEOUT_SECONDS: u64 = 240;

/// Default policy-programming wait in seconds.
pub const DEFAULT_POLICY_TIMEOUT_SECONDS: u64 = 240;

/// Default termination wait in seconds.
pub const DEFAULT_TERMINATE_TIMEOUT_SECONDS: u64 = 240;

/// Default fixed poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default probe budget (outer `timeout` wrapper) in seconds.
pub const DEFAULT_PROBE_BUDGET_SECONDS: u64 = 5;

/// Default traffic duration (`iperf3 -t`) in seconds.
pub const DEFAULT_PROBE_DURATION_SECONDS: u64 = 3;

/// Default report interval (`iperf3 -i`) in seconds.
pub const DEFAULT_PROBE_INTERVAL_SECONDS: u64 = 1;

/// Default number of concurrent probes per regime. An iperf3 server accepts
/// one test at a time.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 1;

/// Default number of re-probes granted to a convergence-lagged cell.
pub const DEFAULT_CONVERGENCE_REPROBES: u32 = 1;

/// Default namespace of the enforcement agent pods.
pub const DEFAULT_AUDIT_NAMESPACE: &str = "kube-system";

/// Default label selector of the enforcement agent pods.
pub const DEFAULT_AUDIT_SELECTOR: &str = "k8s-app=cilium";

/// Default policy acknowledgement source: `agents` or `status`.
pub const DEFAULT_POLICY_ACK: &str = "agents";

/// Default agent status commands captured as diagnostics on failure,
/// separated by `;`.
pub const DEFAULT_AGENT_REPORT_COMMANDS: &str =
    "cilium-dbg status --verbose;cilium-dbg endpoint list;cilium-dbg service list";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Platform the cluster runs on.
///
/// Some managed platforms ship kernels without SCTP support; scenarios that
/// need it are skipped there instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Kind,
    Gke,
    Other,
}

impl Platform {
    /// Returns true if the platform's kernel is known to carry `protocol`.
    pub fn supports(self, protocol: Protocol) -> bool {
        !(self == Platform::Gke && protocol == Protocol::Sctp)
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kind" => Ok(Platform::Kind),
            "gke" => Ok(Platform::Gke),
            "other" => Ok(Platform::Other),
            _ => Err(ConfigError::InvalidValue(format!(
                "HARNESS_PLATFORM must be one of kind, gke, other (got {s})"
            ))),
        }
    }
}

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// kubectl binary (default: "kubectl").
    pub kubectl: String,

    /// kubeconfig context; `None` uses the current context.
    pub kube_context: Option<String>,

    /// Namespace exclusively owned by the running scenario.
    pub namespace: String,

    /// Directory the manifest names are resolved against.
    pub assets_root: PathBuf,

    /// Timeout applied to every individual kubectl call.
    pub command_timeout: Duration,

    pub ready_timeout: Duration,
    pub policy_timeout: Duration,
    pub terminate_timeout: Duration,

    /// Fixed interval for readiness, convergence and termination polls.
    pub poll_interval: Duration,

    pub protocol: Protocol,

    pub probe: ProbeSpec,

    /// Upper bound on probes executing at once within a regime.
    pub probe_concurrency: usize,

    /// Re-probes granted to a cell that observed the pre-transition outcome
    /// inside the convergence window.
    pub convergence_reprobes: u32,

    pub platform: Platform,

    pub audit_namespace: String,
    pub audit_selector: String,

    /// How policy programming and removal are confirmed. `Agents` queries
    /// the pods matched by `audit_selector` in `audit_namespace`.
    pub policy_ack: Acknowledgement,

    /// Regexes for agent log lines that are never anomalies.
    pub audit_benign_patterns: Vec<String>,

    /// argv of each command exec'd in an agent pod when capturing diagnostics.
    pub agent_report_commands: Vec<Vec<String>>,

    /// Where to write the JSON verdict report, if anywhere.
    pub report_path: Option<PathBuf>,

    pub json_logs: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kubectl: DEFAULT_KUBECTL.to_string(),
            kube_context: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            assets_root: PathBuf::from(DEFAULT_ASSETS_ROOT),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECONDS),
            policy_timeout: Duration::from_secs(DEFAULT_POLICY_TIMEOUT_SECONDS),
            terminate_timeout: Duration::from_secs(DEFAULT_TERMINATE_TIMEOUT_SECONDS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            protocol: Protocol::Sctp,
            probe: ProbeSpec::default(),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            convergence_reprobes: DEFAULT_CONVERGENCE_REPROBES,
            platform: Platform::Kind,
            audit_namespace: DEFAULT_AUDIT_NAMESPACE.to_string(),
            audit_selector: DEFAULT_AUDIT_SELECTOR.to_string(),
            policy_ack: Acknowledgement::Agents {
                namespace: DEFAULT_AUDIT_NAMESPACE.to_string(),
                selector: DEFAULT_AUDIT_SELECTOR.to_string(),
                cli: DEFAULT_AGENT_CLI.to_string(),
            },
            audit_benign_patterns: Vec::new(),
            agent_report_commands: split_commands(DEFAULT_AGENT_REPORT_COMMANDS),
            report_path: None,
            json_logs: false,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let kubectl = vars
            .get("HARNESS_KUBECTL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_KUBECTL.to_string());

        let kube_context = vars
            .get("HARNESS_KUBE_CONTEXT")
            .filter(|s| !s.is_empty())
            .cloned();

        let namespace = vars
            .get("HARNESS_NAMESPACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.is_empty() {
            return Err(ConfigError::InvalidValue(
                "HARNESS_NAMESPACE must not be empty".to_string(),
            ));
        }

        let assets_root = PathBuf::from(
            vars.get("HARNESS_ASSETS_ROOT")
                .map_or(DEFAULT_ASSETS_ROOT, String::as_str),
        );

        let command_timeout = Duration::from_secs(parse_or(
            vars,
            "HARNESS_COMMAND_TIMEOUT_SECONDS",
            DEFAULT_COMMAND_TIMEOUT_SECONDS,
        )?);
        let ready_timeout = Duration::from_secs(parse_or(
            vars,
            "HARNESS_READY_TIMEOUT_SECONDS",
            DEFAULT_READY_TIMEOUT_SECONDS,
        )?);
        let policy_timeout = Duration::from_secs(parse_or(
            vars,
            "HARNESS_POLICY_TIMEOUT_SECONDS",
            DEFAULT_POLICY_TIMEOUT_SECONDS,
        )?);
        let terminate_timeout = Duration::from_secs(parse_or(
            vars,
            "HARNESS_TERMINATE_TIMEOUT_SECONDS",
            DEFAULT_TERMINATE_TIMEOUT_SECONDS,
        )?);
        let poll_interval = Duration::from_millis(parse_or(
            vars,
            "HARNESS_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "HARNESS_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let protocol = match vars.get("HARNESS_PROTOCOL") {
            Some(value) => value.parse::<Protocol>().map_err(ConfigError::InvalidValue)?,
            None => Protocol::Sctp,
        };

        let probe = ProbeSpec {
            budget: Duration::from_secs(parse_or(
                vars,
                "HARNESS_PROBE_BUDGET_SECONDS",
                DEFAULT_PROBE_BUDGET_SECONDS,
            )?),
            duration: Duration::from_secs(parse_or(
                vars,
                "HARNESS_PROBE_DURATION_SECONDS",
                DEFAULT_PROBE_DURATION_SECONDS,
            )?),
            report_interval: Duration::from_secs(parse_or(
                vars,
                "HARNESS_PROBE_INTERVAL_SECONDS",
                DEFAULT_PROBE_INTERVAL_SECONDS,
            )?),
            ..ProbeSpec::default()
        };
        probe.validate().map_err(ConfigError::InvalidValue)?;

        let probe_concurrency = parse_or(
            vars,
            "HARNESS_PROBE_CONCURRENCY",
            DEFAULT_PROBE_CONCURRENCY,
        )?;
        if probe_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "HARNESS_PROBE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let convergence_reprobes = parse_or(
            vars,
            "HARNESS_CONVERGENCE_REPROBES",
            DEFAULT_CONVERGENCE_REPROBES,
        )?;

        let platform = match vars.get("HARNESS_PLATFORM") {
            Some(value) => value.parse()?,
            None => Platform::Kind,
        };

        let audit_namespace = vars
            .get("HARNESS_AUDIT_NAMESPACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_AUDIT_NAMESPACE.to_string());

        let audit_selector = vars
            .get("HARNESS_AUDIT_SELECTOR")
            .cloned()
            .unwrap_or_else(|| DEFAULT_AUDIT_SELECTOR.to_string());

        let agent_cli = vars
            .get("HARNESS_AGENT_CLI")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_AGENT_CLI.to_string());

        let policy_ack = match vars
            .get("HARNESS_POLICY_ACK")
            .map_or(DEFAULT_POLICY_ACK, String::as_str)
            .to_ascii_lowercase()
            .as_str()
        {
            "agents" => Acknowledgement::Agents {
                namespace: audit_namespace.clone(),
                selector: audit_selector.clone(),
                cli: agent_cli,
            },
            "status" => Acknowledgement::ObjectStatus,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "HARNESS_POLICY_ACK must be one of agents, status (got {other})"
                )))
            }
        };

        let audit_benign_patterns = vars
            .get("HARNESS_AUDIT_BENIGN_PATTERNS")
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let agent_report_commands = split_commands(
            vars.get("HARNESS_AGENT_REPORT_COMMANDS")
                .map_or(DEFAULT_AGENT_REPORT_COMMANDS, String::as_str),
        );

        let report_path = vars
            .get("HARNESS_REPORT_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let json_logs = vars
            .get("HARNESS_JSON_LOGS")
            .is_some_and(|v| v == "true" || v == "1");

        Ok(Self {
            kubectl,
            kube_context,
            namespace,
            assets_root,
            command_timeout,
            ready_timeout,
            policy_timeout,
            terminate_timeout,
            poll_interval,
            protocol,
            probe,
            probe_concurrency,
            convergence_reprobes,
            platform,
            audit_namespace,
            audit_selector,
            policy_ack,
            audit_benign_patterns,
            agent_report_commands,
            report_path,
            json_logs,
        })
    }
}

/// Split `a b;c d` into `[["a", "b"], ["c", "d"]]`, dropping empty commands.
fn split_commands(raw: &str) -> Vec<Vec<String>> {
    raw.split(';')
        .map(|cmd| cmd.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|argv| !argv.is_empty())
        .collect()
}

/// Parse `key` if present, otherwise return `default`.
fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} is not a valid number: {raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.kubectl, "kubectl");
        assert_eq!(config.kube_context, None);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.assets_root, PathBuf::from("manifests/sctp"));
        assert_eq!(config.command_timeout, Duration::from_secs(60));
        assert_eq!(config.ready_timeout, Duration::from_secs(240));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.protocol, Protocol::Sctp);
        assert_eq!(config.probe.budget, Duration::from_secs(5));
        assert_eq!(config.probe.duration, Duration::from_secs(3));
        assert_eq!(config.probe_concurrency, 1);
        assert_eq!(config.convergence_reprobes, 1);
        assert_eq!(config.platform, Platform::Kind);
        assert_eq!(config.audit_selector, "k8s-app=cilium");
        assert_eq!(
            config.policy_ack,
            Acknowledgement::Agents {
                namespace: "kube-system".to_string(),
                selector: "k8s-app=cilium".to_string(),
                cli: "cilium-dbg".to_string(),
            }
        );
        assert_eq!(config.policy_ack, HarnessConfig::default().policy_ack);
        assert!(config.report_path.is_none());
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let config = HarnessConfig::from_vars(&vars(&[
            ("HARNESS_KUBE_CONTEXT", "kind-policy"),
            ("HARNESS_NAMESPACE", "sctp-conformance"),
            ("HARNESS_PROTOCOL", "tcp"),
            ("HARNESS_POLL_INTERVAL_MS", "250"),
            ("HARNESS_PROBE_CONCURRENCY", "2"),
            ("HARNESS_PLATFORM", "gke"),
            ("HARNESS_REPORT_PATH", "/tmp/verdict.json"),
            ("HARNESS_JSON_LOGS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.kube_context.as_deref(), Some("kind-policy"));
        assert_eq!(config.namespace, "sctp-conformance");
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.probe_concurrency, 2);
        assert_eq!(config.platform, Platform::Gke);
        assert_eq!(config.report_path, Some(PathBuf::from("/tmp/verdict.json")));
        assert!(config.json_logs);
    }

    #[test]
    fn test_policy_ack_follows_agent_settings() {
        let config = HarnessConfig::from_vars(&vars(&[
            ("HARNESS_AUDIT_NAMESPACE", "cilium"),
            ("HARNESS_AUDIT_SELECTOR", "app.kubernetes.io/name=cilium-agent"),
            ("HARNESS_AGENT_CLI", "cilium"),
        ]))
        .unwrap();
        assert_eq!(
            config.policy_ack,
            Acknowledgement::Agents {
                namespace: "cilium".to_string(),
                selector: "app.kubernetes.io/name=cilium-agent".to_string(),
                cli: "cilium".to_string(),
            }
        );

        let config = HarnessConfig::from_vars(&vars(&[("HARNESS_POLICY_ACK", "Status")])).unwrap();
        assert_eq!(config.policy_ack, Acknowledgement::ObjectStatus);

        let err = HarnessConfig::from_vars(&vars(&[("HARNESS_POLICY_ACK", "nodes")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(msg) if msg.contains("HARNESS_POLICY_ACK")));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = HarnessConfig::from_vars(&vars(&[("HARNESS_READY_TIMEOUT_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(msg) if msg.contains("HARNESS_READY_TIMEOUT_SECONDS")));
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let err = HarnessConfig::from_vars(&vars(&[("HARNESS_PROTOCOL", "quic")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_budget_must_exceed_transfer_duration() {
        let err = HarnessConfig::from_vars(&vars(&[
            ("HARNESS_PROBE_BUDGET_SECONDS", "3"),
            ("HARNESS_PROBE_DURATION_SECONDS", "3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = HarnessConfig::from_vars(&vars(&[("HARNESS_PROBE_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_list_values() {
        let config = HarnessConfig::from_vars(&vars(&[
            ("HARNESS_AUDIT_BENIGN_PATTERNS", "Unable to update ipcache; ;deadline exceeded"),
            ("HARNESS_AGENT_REPORT_COMMANDS", "cilium-dbg status;;cilium-dbg bpf ct list global"),
        ]))
        .unwrap();

        assert_eq!(
            config.audit_benign_patterns,
            vec!["Unable to update ipcache", "deadline exceeded"]
        );
        assert_eq!(config.agent_report_commands.len(), 2);
        assert_eq!(
            config.agent_report_commands.last().unwrap(),
            &vec!["cilium-dbg", "bpf", "ct", "list", "global"]
        );

        let defaults = HarnessConfig::default();
        assert_eq!(defaults.agent_report_commands.len(), 3);
        assert!(defaults.audit_benign_patterns.is_empty());
    }

    #[test]
    fn test_gke_does_not_support_sctp() {
        assert!(!Platform::Gke.supports(Protocol::Sctp));
        assert!(Platform::Gke.supports(Protocol::Tcp));
        assert!(Platform::Kind.supports(Protocol::Sctp));
    }
}
