//! taskmon: live console view of the task lifecycle event stream.

use std::sync::Arc;

use clap::Parser;
use taskmon::broker::{Broker, PgmqBroker};
use taskmon::config::{Config, ExposeSecret};
use taskmon::monitor::{ConsoleSink, Monitor, MonitorConfig, Reconciler};
use taskmon::telemetry::{TelemetryConfig, init_telemetry};
use taskmon::worker::PolicyRegistry;

#[derive(Parser)]
#[command(name = "taskmon", about = "Monitor task lifecycle events")]
struct Cli {
    /// Also print the raw event and the full task record for each change
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new("taskmon")
            .endpoint(config.otel_endpoint.clone())
            .log_level(config.log_level.clone()),
    )?;

    let broker = Arc::new(PgmqBroker::connect(config.broker_url.expose_secret()).await?);
    broker.ensure_queue(&config.event_queue).await?;

    let mut reconciler = Reconciler::new();
    if let Some(path) = &config.policy_file {
        let policies = PolicyRegistry::load(path)?;
        reconciler = reconciler
            .with_retry_limits(policies.retry_limits())
            .with_default_retry_limit(policies.default_max_retries());
    }

    let mut monitor = Monitor::new(
        broker,
        ConsoleSink::stdout(cli.verbose),
        MonitorConfig::from_config(&config),
    )
    .with_reconciler(reconciler);

    tokio::select! {
        result = monitor.listen() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    Ok(())
}
