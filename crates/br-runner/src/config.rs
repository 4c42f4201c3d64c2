//! Worker configuration, built once at process start.

use std::time::Duration;

use br_types::{config_error, BrResult, TrialId};
use uuid::Uuid;

use crate::timed::timeout_from_secs;

pub const ENV_EXPERIMENT_ID: &str = "EXPERIMENT_ID";
pub const ENV_TRIAL_IDS: &str = "TRIAL_IDS";
pub const ENV_DB_URL: &str = "DB_URL";
pub const ENV_TIMEOUT: &str = "TIMEOUT";
pub const ENV_RAISE_EXCEPTION: &str = "RAISE_EXCEPTION";
pub const ENV_WORKER_ID: &str = "WORKER_ID";

/// Settings for one worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Grouping identifier, passed through for logging.
    pub experiment_id: String,

    /// Candidate trials this worker was launched for. Informational: work is
    /// claimed through the store regardless.
    pub trial_ids: Vec<TrialId>,

    /// Store connection string.
    pub db_url: String,

    /// Per-trial wall-clock budget; `None` is unbounded.
    pub timeout: Option<Duration>,

    /// Stop the worker after recording the first failed trial.
    pub raise_on_failure: bool,

    /// Identity recorded on every claimed trial.
    pub worker_id: String,
}

impl WorkerConfig {
    pub fn new(experiment_id: impl Into<String>, db_url: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            trial_ids: Vec::new(),
            db_url: db_url.into(),
            timeout: None,
            raise_on_failure: false,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_trial_ids(mut self, trial_ids: Vec<TrialId>) -> Self {
        self.trial_ids = trial_ids;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_raise_on_failure(mut self, raise: bool) -> Self {
        self.raise_on_failure = raise;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Read the configuration from process environment variables.
    pub fn from_env() -> BrResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> BrResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| config_error!("Missing required variable: {}", key))
        };

        let experiment_id = required(ENV_EXPERIMENT_ID)?;
        let trial_ids = parse_trial_ids(&required(ENV_TRIAL_IDS)?)?;
        let db_url = required(ENV_DB_URL)?;

        let timeout = match lookup(ENV_TIMEOUT) {
            Some(raw) => {
                let seconds: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| config_error!("{} must be a number of seconds, got '{}'", ENV_TIMEOUT, raw))?;
                if seconds.is_nan() {
                    return Err(config_error!("{} must not be NaN", ENV_TIMEOUT));
                }
                timeout_from_secs(seconds)
            }
            None => None,
        };

        let raise_on_failure = lookup(ENV_RAISE_EXCEPTION).as_deref() == Some("True");

        let mut config = Self::new(experiment_id, db_url)
            .with_trial_ids(trial_ids)
            .with_timeout(timeout)
            .with_raise_on_failure(raise_on_failure);
        if let Some(worker_id) = lookup(ENV_WORKER_ID).filter(|id| !id.trim().is_empty()) {
            config = config.with_worker_id(worker_id);
        }
        Ok(config)
    }
}

fn parse_trial_ids(raw: &str) -> BrResult<Vec<TrialId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<TrialId>()
                .map_err(|e| config_error!("Invalid trial id '{}' in {}: {}", part, ENV_TRIAL_IDS, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use br_types::BrError;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("EXPERIMENT_ID", "exp-7"),
        ("TRIAL_IDS", "1, 2,3"),
        ("DB_URL", "sqlite:////tmp/bench.db"),
    ];

    #[test]
    fn minimal_environment_uses_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&BASE)).unwrap();

        assert_eq!(config.experiment_id, "exp-7");
        assert_eq!(config.trial_ids, vec![TrialId(1), TrialId(2), TrialId(3)]);
        assert_eq!(config.db_url, "sqlite:////tmp/bench.db");
        assert_eq!(config.timeout, None);
        assert!(!config.raise_on_failure);
        assert!(Uuid::parse_str(&config.worker_id).is_ok());
    }

    #[test]
    fn optional_variables_are_honoured() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("TIMEOUT", "2.5"),
            ("RAISE_EXCEPTION", "True"),
            ("WORKER_ID", "node-3"),
        ]);
        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert!(config.raise_on_failure);
        assert_eq!(config.worker_id, "node-3");
    }

    #[test]
    fn zero_timeout_is_unbounded_and_raise_needs_exact_true() {
        let mut vars = BASE.to_vec();
        vars.extend([("TIMEOUT", "0"), ("RAISE_EXCEPTION", "true")]);
        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.timeout, None);
        assert!(!config.raise_on_failure);
    }

    #[test]
    fn missing_required_variable_is_a_config_error() {
        let err = WorkerConfig::from_lookup(lookup(&BASE[..2])).unwrap_err();
        match err {
            BrError::Config(message) => assert!(message.contains("DB_URL")),
            other => panic!("Expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut vars = BASE.to_vec();
        vars.push(("TIMEOUT", "soon"));
        assert!(WorkerConfig::from_lookup(lookup(&vars)).is_err());

        let vars = [
            ("EXPERIMENT_ID", "exp"),
            ("TRIAL_IDS", "1,x"),
            ("DB_URL", "memory://"),
        ];
        assert!(WorkerConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn empty_trial_list_is_allowed() {
        let vars = [
            ("EXPERIMENT_ID", "exp"),
            ("TRIAL_IDS", ""),
            ("DB_URL", "memory://"),
        ];
        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();
        assert!(config.trial_ids.is_empty());
    }
}
