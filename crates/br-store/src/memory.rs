use std::collections::BTreeMap;

use br_types::{Asset, StatusCounts, StoreResult, Trial, TrialId, TrialStatus};
use chrono::Utc;
use parking_lot::Mutex;

use crate::TrialStore;

#[derive(Debug, Default)]
struct Ledger {
    trials: BTreeMap<TrialId, Trial>,
    last_id: i64,
}

/// Process-private trial store.
///
/// Every operation runs under a single lock, which makes claims atomic across
/// threads. Used for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrialStore for MemoryStore {
    fn pick_trial(&self, worker_id: &str) -> StoreResult<Option<TrialId>> {
        let mut ledger = self.ledger.lock();
        let claimed = ledger
            .trials
            .values_mut()
            .find(|t| t.status == TrialStatus::Pending)
            .map(|trial| {
                trial.status = TrialStatus::Running;
                trial.worker_id = Some(worker_id.to_string());
                trial.started_at = Some(Utc::now());
                trial.id
            });
        Ok(claimed)
    }

    fn find_trial_by_id(&self, id: TrialId) -> StoreResult<Option<Trial>> {
        Ok(self.ledger.lock().trials.get(&id).cloned())
    }

    fn end_trial(&self, id: TrialId, error_message: Option<&str>) -> StoreResult<bool> {
        let mut ledger = self.ledger.lock();
        let Some(trial) = ledger.trials.get_mut(&id) else {
            return Ok(false);
        };
        if trial.status != TrialStatus::Running {
            return Ok(false);
        }

        trial.status = match error_message {
            None => TrialStatus::Complete,
            Some(_) => TrialStatus::Failed,
        };
        trial.error_message = error_message.map(str::to_string);
        trial.ended_at = Some(Utc::now());
        Ok(true)
    }

    fn add_trial(&self, experiment_id: &str, assets: Vec<Asset>) -> StoreResult<TrialId> {
        let mut ledger = self.ledger.lock();
        ledger.last_id += 1;
        let id = TrialId(ledger.last_id);
        ledger
            .trials
            .insert(id, Trial::pending(id, experiment_id, assets));
        Ok(id)
    }

    fn trials_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<Trial>> {
        Ok(self
            .ledger
            .lock()
            .trials
            .values()
            .filter(|t| t.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    fn status_counts(&self, experiment_id: &str) -> StoreResult<StatusCounts> {
        let ledger = self.ledger.lock();
        let mut counts = StatusCounts::default();
        for trial in ledger.trials.values().filter(|t| t.experiment_id == experiment_id) {
            counts.record(trial.status);
        }
        Ok(counts)
    }

    fn stale_running(&self, older_than: chrono::Duration) -> StoreResult<Vec<TrialId>> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return Ok(Vec::new());
        };
        Ok(self
            .ledger
            .lock()
            .trials
            .values()
            .filter(|t| t.status == TrialStatus::Running)
            .filter(|t| t.started_at.map_or(true, |started| started <= cutoff))
            .map(|t| t.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn contract_claims_in_arrival_order() {
        contract::claims_in_arrival_order(&MemoryStore::new());
    }

    #[test]
    fn contract_end_trial_is_terminal() {
        contract::end_trial_is_terminal(&MemoryStore::new());
    }

    #[test]
    fn contract_end_trial_requires_running() {
        contract::end_trial_requires_running(&MemoryStore::new());
    }

    #[test]
    fn contract_missing_trial_is_none() {
        contract::missing_trial_is_none(&MemoryStore::new());
    }

    #[test]
    fn contract_experiment_summaries() {
        contract::experiment_summaries(&MemoryStore::new());
    }

    #[test]
    fn contract_stale_running_lists_old_claims() {
        contract::stale_running_lists_old_claims(&MemoryStore::new());
    }

    #[test]
    fn contract_stale_running_survives_unbounded_age() {
        contract::stale_running_survives_unbounded_age(&MemoryStore::new());
    }

    #[test]
    fn racing_callers_claim_each_trial_once() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..5 {
            store.add_trial("race", vec![]).unwrap();
        }

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.pick_trial(&format!("w{i}")).unwrap())
            })
            .collect();

        let claimed: Vec<TrialId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = claimed.iter().copied().collect();

        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
    }
}
