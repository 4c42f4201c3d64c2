//! # br-runner
//!
//! Worker side of benchrun: the loop that claims trials from the shared
//! store, resolves their run functions, executes them under a deadline and
//! records the outcome.

pub mod config;
pub mod pool;
pub mod timed;
pub mod worker;

pub use config::WorkerConfig;
pub use pool::LocalPool;
pub use timed::{timed_run, timeout_from_secs, RunFailure, TimedRun};
pub use worker::{run_trials, Worker, WorkerReport};
