//! Run functions shipped with the worker binary.

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use br_types::Trial;
use serde::Deserialize;
use serde_json::Value;

use crate::function::FunctionRegistry;

/// Environment variable carrying the trial id into `command` subprocesses.
pub const ENV_TRIAL_ID: &str = "BENCHRUN_TRIAL_ID";
/// Environment variable carrying the experiment id into `command` subprocesses.
pub const ENV_EXPERIMENT_ID: &str = "BENCHRUN_EXPERIMENT_ID";

const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    seconds: f64,
}

#[derive(Debug, Deserialize)]
struct FailArgs {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(name: &str, args: &Value) -> anyhow::Result<T> {
    serde_json::from_value(args.clone()).with_context(|| format!("invalid arguments for '{name}'"))
}

/// Registry pre-populated with `noop`, `sleep`, `fail` and `command`.
pub fn builtin_registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with("noop", |_, _| Ok(()))
        .with("sleep", sleep)
        .with("fail", fail)
        .with("command", command)
}

fn sleep(_trial: &Trial, args: &Value) -> anyhow::Result<()> {
    let SleepArgs { seconds } = parse_args("sleep", args)?;
    let duration = Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("invalid sleep duration {seconds}"))?;
    thread::sleep(duration);
    Ok(())
}

fn fail(_trial: &Trial, args: &Value) -> anyhow::Result<()> {
    let FailArgs { message } = parse_args("fail", args)?;
    bail!(message)
}

/// Runs `program` and waits for it to exit.
///
/// The child is not killed when the worker's deadline passes: the abandoned
/// run-function thread keeps waiting on it, so a timed-out command can still
/// be running while later trials execute.
fn command(trial: &Trial, args: &Value) -> anyhow::Result<()> {
    let CommandArgs { program, args } = parse_args("command", args)?;

    let output = Command::new(&program)
        .args(&args)
        .env(ENV_TRIAL_ID, trial.id.to_string())
        .env(ENV_EXPERIMENT_ID, &trial.experiment_id)
        .output()
        .with_context(|| format!("failed to spawn '{program}'"))?;

    if !output.status.success() {
        let stderr = &output.stderr[output.stderr.len().saturating_sub(STDERR_TAIL_BYTES)..];
        bail!(
            "'{}' exited with {}\n{}",
            program,
            output.status,
            String::from_utf8_lossy(stderr).trim_end()
        );
    }
    Ok(())
}
