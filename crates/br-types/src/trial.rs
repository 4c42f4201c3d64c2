//! Trial and asset records shared by the store, codec and runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned trial identifier. Ids increase in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialId(pub i64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrialId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TrialId)
    }
}

impl From<i64> for TrialId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a trial.
///
/// Transitions only move forward: `Pending -> Running -> {Complete, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Complete" => Ok(Self::Complete),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown trial status '{other}'")),
        }
    }
}

/// Immutable typed blob attached to a trial as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub mimetype: String,
    pub embedded: Vec<u8>,
}

impl Asset {
    pub fn new(name: impl Into<String>, mimetype: impl Into<String>, embedded: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mimetype: mimetype.into(),
            embedded,
        }
    }
}

/// A unit of schedulable work.
///
/// Workers only ever hold copies of a trial fetched from the store; state
/// changes go through the store's claim and terminate operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub experiment_id: String,
    pub status: TrialStatus,
    pub input_assets: Vec<Asset>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trial {
    /// A freshly submitted, unclaimed trial.
    pub fn pending(id: TrialId, experiment_id: impl Into<String>, input_assets: Vec<Asset>) -> Self {
        Self {
            id,
            experiment_id: experiment_id.into(),
            status: TrialStatus::Pending,
            input_assets,
            worker_id: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// First input asset with the given name.
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.input_assets.iter().find(|a| a.name == name)
    }

    /// All input assets carrying `mimetype`, in submission order.
    pub fn assets_of<'a>(&'a self, mimetype: &'a str) -> impl Iterator<Item = &'a Asset> + 'a {
        self.input_assets.iter().filter(move |a| a.mimetype == mimetype)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-status trial totals for one experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TrialStatus) {
        match status {
            TrialStatus::Pending => self.pending += 1,
            TrialStatus::Running => self.running += 1,
            TrialStatus::Complete => self.complete += 1,
            TrialStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.complete + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use TrialStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Complete));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Complete.can_transition_to(Complete));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            TrialStatus::Pending,
            TrialStatus::Running,
            TrialStatus::Complete,
            TrialStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TrialStatus>().unwrap(), status);
        }
        assert!("Done".parse::<TrialStatus>().is_err());
    }

    #[test]
    fn trial_id_parses_with_whitespace() {
        assert_eq!(" 42".parse::<TrialId>().unwrap(), TrialId(42));
        assert!("abc".parse::<TrialId>().is_err());
    }

    #[test]
    fn asset_lookup() {
        let trial = Trial::pending(
            TrialId(1),
            "exp",
            vec![
                Asset::new("data", "application/json", b"{}".to_vec()),
                Asset::new("notes", "text/plain", b"a".to_vec()),
                Asset::new("extra", "text/plain", b"b".to_vec()),
            ],
        );

        assert_eq!(trial.asset("notes").unwrap().embedded, b"a");
        assert!(trial.asset("missing").is_none());
        assert_eq!(trial.assets_of("text/plain").count(), 2);
        assert!(!trial.is_terminal());
    }

    #[test]
    fn status_counts_totals() {
        let mut counts = StatusCounts::default();
        counts.record(TrialStatus::Pending);
        counts.record(TrialStatus::Failed);
        counts.record(TrialStatus::Failed);

        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total(), 3);
    }
}
