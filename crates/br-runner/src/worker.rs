//! The trial runner loop each worker process drives.

use std::thread;
use std::time::Duration;

use br_codec::{BoundRunFn, FunctionRegistry, MIMETYPE_FUNC};
use br_store::{open_store, TrialStore};
use br_types::{BrResult, DecodeError, StoreResult, Trial, TrialId, WorkerError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::timed::{timed_run, RunFailure};

/// Totals for one worker loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl WorkerReport {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Self::default()
        }
    }
}

/// Why a claimed trial did not complete.
#[derive(Debug, Error)]
enum TrialFailure {
    #[error("Failed to decode run function: {0}")]
    Decode(#[from] DecodeError),

    #[error("Timeout failure ({0:?})")]
    Timeout(Duration),

    #[error("{0}")]
    Raised(anyhow::Error),
}

impl TrialFailure {
    /// Text persisted as the trial's error message. Run-function errors and
    /// panics keep their cause chain, panic location and stack trace.
    fn detail(&self) -> String {
        match self {
            Self::Raised(err) => match err.downcast_ref::<RunFailure>() {
                Some(failure) => failure.detail.clone(),
                None => format!("{err:?}"),
            },
            other => other.to_string(),
        }
    }
}

/// Ends a claimed trial exactly once.
///
/// [`ClaimGuard::finish`] records the outcome on the normal path. If the guard
/// is dropped unfinished (the loop body unwound), the trial is recorded as
/// failed so it is not left running.
struct ClaimGuard<'a> {
    store: &'a dyn TrialStore,
    trial_id: TrialId,
    finished: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(store: &'a dyn TrialStore, trial_id: TrialId) -> Self {
        Self {
            store,
            trial_id,
            finished: false,
        }
    }

    fn finish(mut self, error_message: Option<&str>) -> StoreResult<bool> {
        self.finished = true;
        self.store.end_trial(self.trial_id, error_message)
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let message = if thread::panicking() {
            "Worker panicked before recording the trial outcome"
        } else {
            "Worker stopped before recording the trial outcome"
        };
        match self.store.end_trial(self.trial_id, Some(message)) {
            Ok(_) => warn!(trial_id = %self.trial_id, "{}", message),
            Err(e) => error!(trial_id = %self.trial_id, "Failed to record abandoned trial: {}", e),
        }
    }
}

/// One worker's loop over the shared store.
pub struct Worker<'a> {
    store: &'a dyn TrialStore,
    registry: &'a FunctionRegistry,
    config: &'a WorkerConfig,
    override_fn: Option<BoundRunFn>,
}

impl<'a> Worker<'a> {
    pub fn new(
        store: &'a dyn TrialStore,
        registry: &'a FunctionRegistry,
        config: &'a WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            override_fn: None,
        }
    }

    /// Run every trial with `run_fn` instead of its stored run function.
    pub fn with_override(mut self, run_fn: BoundRunFn) -> Self {
        self.override_fn = Some(run_fn);
        self
    }

    /// Claim and execute trials until the store has no pending work.
    ///
    /// Trial failures are recorded and the loop continues, unless
    /// `raise_on_failure` is set. Store errors, a claimed trial that cannot
    /// be found, and a trial without a run function stop the worker.
    pub fn run(&self) -> BrResult<WorkerReport> {
        let config = self.config;
        info!(
            worker_id = %config.worker_id,
            experiment_id = %config.experiment_id,
            candidates = config.trial_ids.len(),
            timeout = ?config.timeout,
            "Worker started"
        );

        let mut report = WorkerReport::new(&config.worker_id);
        while let Some(trial_id) = self.store.pick_trial(&config.worker_id)? {
            report.claimed += 1;
            self.run_claimed(trial_id, &mut report)?;
        }

        info!(
            worker_id = %report.worker_id,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            timed_out = report.timed_out,
            "No pending trials left; worker finished"
        );
        Ok(report)
    }

    fn run_claimed(&self, trial_id: TrialId, report: &mut WorkerReport) -> BrResult<()> {
        let trial = self
            .store
            .find_trial_by_id(trial_id)?
            .ok_or(WorkerError::TrialNotFound { trial_id })?;

        if !self.config.trial_ids.is_empty() && !self.config.trial_ids.contains(&trial_id) {
            debug!(%trial_id, "Claimed trial outside this worker's candidate list");
        }

        let run_fn = self
            .resolve_run_fn(&trial)
            .ok_or(WorkerError::MissingRunFunction { trial_id })?;

        let guard = ClaimGuard::new(self.store, trial_id);
        let failure = match run_fn {
            Ok(run_fn) => self.execute(run_fn, trial),
            Err(e) => Some(TrialFailure::from(e)),
        };

        let error_message = failure.as_ref().map(TrialFailure::detail);
        if !guard.finish(error_message.as_deref())? {
            warn!(%trial_id, "Trial was no longer running when its outcome was recorded; skipped");
        }

        match failure {
            None => {
                report.completed += 1;
                info!(%trial_id, "Trial complete");
            }
            Some(failure) => {
                report.failed += 1;
                if matches!(failure, TrialFailure::Timeout(_)) {
                    report.timed_out += 1;
                }
                warn!(%trial_id, "Trial failed: {}", failure);

                if self.config.raise_on_failure {
                    return Err(WorkerError::TrialFailed {
                        trial_id,
                        detail: error_message.unwrap_or_default(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The override if one was supplied, otherwise the trial's run-function
    /// asset (the last one wins). `None` when the trial carries no run
    /// function.
    fn resolve_run_fn(&self, trial: &Trial) -> Option<Result<BoundRunFn, DecodeError>> {
        if let Some(run_fn) = &self.override_fn {
            return Some(Ok(run_fn.clone()));
        }
        trial
            .assets_of(MIMETYPE_FUNC)
            .last()
            .map(|asset| self.registry.deserialize(&asset.mimetype, &asset.embedded))
    }

    fn execute(&self, run_fn: BoundRunFn, trial: Trial) -> Option<TrialFailure> {
        debug!(trial_id = %trial.id, run_fn = run_fn.name(), "Executing trial");
        match timed_run(move || run_fn.call(&trial), self.config.timeout) {
            Ok(run) if run.timed_out => Some(TrialFailure::Timeout(run.duration)),
            Ok(run) => {
                debug!(duration = ?run.duration, "Run function returned");
                None
            }
            Err(err) => Some(TrialFailure::Raised(err)),
        }
    }
}

/// Open the store named in `config` and drive a worker loop against it.
///
/// `debug_fn`, when given, replaces every trial's stored run function.
pub fn run_trials(
    config: &WorkerConfig,
    registry: &FunctionRegistry,
    debug_fn: Option<BoundRunFn>,
) -> BrResult<WorkerReport> {
    let store = open_store(&config.db_url)?;
    let mut worker = Worker::new(store.as_ref(), registry, config);
    if let Some(run_fn) = debug_fn {
        worker = worker.with_override(run_fn);
    }
    worker.run()
}
