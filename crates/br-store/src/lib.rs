//! # br-store
//!
//! The trial ledger shared by every worker. All trial state changes go through
//! two atomic operations: [`TrialStore::pick_trial`] claims a pending trial
//! and [`TrialStore::end_trial`] records its outcome.

pub mod memory;
pub mod sqlite;
pub mod url;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use url::{open_store, StoreUrl};

use br_types::{Asset, StatusCounts, StoreResult, Trial, TrialId};

/// Store interface consumed by the trial runner.
pub trait TrialStore: Send + Sync {
    /// Atomically claim one pending trial for `worker_id` and move it to
    /// `Running`. Returns `None` when no pending work remains. Concurrent
    /// callers never receive the same id.
    fn pick_trial(&self, worker_id: &str) -> StoreResult<Option<TrialId>>;

    /// Point lookup including input assets. Absent ids are `Ok(None)`.
    fn find_trial_by_id(&self, id: TrialId) -> StoreResult<Option<Trial>>;

    /// Move a running trial to `Complete` (no error) or `Failed` and stamp
    /// `ended_at`. Returns `false`, changing nothing, when the trial is
    /// missing or not running.
    fn end_trial(&self, id: TrialId, error_message: Option<&str>) -> StoreResult<bool>;

    /// Submit a new pending trial.
    fn add_trial(&self, experiment_id: &str, assets: Vec<Asset>) -> StoreResult<TrialId>;

    fn trials_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<Trial>>;

    fn status_counts(&self, experiment_id: &str) -> StoreResult<StatusCounts>;

    /// Running trials claimed longer than `older_than` ago. Read-only: these
    /// are candidates for orphan inspection and are never requeued.
    fn stale_running(&self, older_than: chrono::Duration) -> StoreResult<Vec<TrialId>>;
}
