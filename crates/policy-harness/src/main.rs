use std::process::ExitCode;
use std::sync::Arc;

use policy_harness::config::HarnessConfig;
use policy_harness::kubectl::Kubectl;
use policy_harness::scenario::{ScenarioRunner, ScenarioSpec};
use policy_harness::session::{ClusterSession, SessionOptions};
use policy_harness::suite::{Suite, EXIT_CONFIG_ERROR};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> ExitCode {
    let config = HarnessConfig::from_env();

    // JSON logs only if the config loaded and asked for them
    let json_logs = config.as_ref().is_ok_and(|c| c.json_logs);
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "policy_harness=info".into()),
        )
        .with(fmt_layer)
        .init();

    info!("Starting policy harness");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let kubectl = Kubectl::new(
        config.kubectl.clone(),
        config.kube_context.clone(),
        config.command_timeout,
    );
    let session = match ClusterSession::connect(
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
    {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open cluster session: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runner = match ScenarioRunner::new(&session, &config) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Invalid audit configuration: {}", e);
            session.close();
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let scenarios = [ScenarioSpec::policy_regimes(&session, config.protocol)];
    let report = Suite::new(runner).run(&scenarios).await;

    if let Some(path) = &config.report_path {
        if let Err(e) = report.write_json(path) {
            error!("Failed to write verdict report: {}", e);
        }
    }

    session.close();
    ExitCode::from(report.exit_code())
}
