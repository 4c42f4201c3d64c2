use anyhow::Context;
use br_codec::builtin_registry;
use br_runner::{run_trials, WorkerConfig};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let registry = builtin_registry();
    tracing::debug!("Registered run functions: {:?}", registry.names());

    let report = run_trials(&config, &registry, None)
        .with_context(|| format!("worker {} stopped", config.worker_id))?;

    tracing::info!(
        "Worker {} done: {} claimed, {} complete, {} failed",
        report.worker_id,
        report.claimed,
        report.completed,
        report.failed
    );
    Ok(())
}
