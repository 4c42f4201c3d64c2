//! Several worker loops in one process, for local runs.

use br_codec::FunctionRegistry;
use br_store::TrialStore;
use br_types::{internal_error, BrResult};
use rayon::prelude::*;
use tracing::info;

use crate::config::WorkerConfig;
use crate::worker::{run_trials, Worker, WorkerReport};

/// Runs `workers` independent worker loops on a dedicated thread pool.
///
/// Each loop gets its own worker id (`<config.worker_id>-<n>`) and behaves
/// exactly like a separate worker process: the only coordination between
/// them is the store's atomic claim.
#[derive(Debug, Clone, Copy)]
pub struct LocalPool {
    workers: usize,
}

impl LocalPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Every worker opens its own connection to `config.db_url`.
    pub fn run(
        &self,
        config: &WorkerConfig,
        registry: &FunctionRegistry,
    ) -> BrResult<Vec<WorkerReport>> {
        self.install(config, |worker_config| run_trials(worker_config, registry, None))
    }

    /// Every worker shares `store`.
    pub fn run_on(
        &self,
        store: &dyn TrialStore,
        config: &WorkerConfig,
        registry: &FunctionRegistry,
    ) -> BrResult<Vec<WorkerReport>> {
        self.install(config, |worker_config| {
            Worker::new(store, registry, worker_config).run()
        })
    }

    fn install<F>(&self, config: &WorkerConfig, run: F) -> BrResult<Vec<WorkerReport>>
    where
        F: Fn(&WorkerConfig) -> BrResult<WorkerReport> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("br-worker-{i}"))
            .build()
            .map_err(|e| internal_error!("Failed to build worker pool: {}", e))?;

        info!(workers = self.workers, experiment_id = %config.experiment_id, "Starting local worker pool");

        pool.install(|| {
            (0..self.workers)
                .into_par_iter()
                .map(|n| {
                    let worker_config = config
                        .clone()
                        .with_worker_id(format!("{}-{}", config.worker_id, n));
                    run(&worker_config)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use br_codec::{Payload, RunFunctionRef};
    use br_store::MemoryStore;
    use br_types::{Asset, TrialStatus};
    use std::thread;
    use std::time::Duration;

    fn run_asset(name: &str) -> Asset {
        Payload::RunFunction(RunFunctionRef::new(name, serde_json::Value::Null))
            .into_asset("run")
            .unwrap()
    }

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .with("ok", |_, _| {
                thread::sleep(Duration::from_millis(5));
                Ok(())
            })
            .with("boom", |_, _| anyhow::bail!("boom"))
    }

    #[test]
    fn pool_size_is_at_least_one() {
        assert_eq!(LocalPool::new(0).workers(), 1);
        assert_eq!(LocalPool::new(4).workers(), 4);
    }

    #[test]
    fn shared_store_is_drained_exactly_once() {
        let store = MemoryStore::new();
        for i in 0..30 {
            let name = if i % 10 == 0 { "boom" } else { "ok" };
            store.add_trial("pool", vec![run_asset(name)]).unwrap();
        }

        let config = WorkerConfig::new("pool", "memory://").with_worker_id("local");
        let reports = LocalPool::new(4).run_on(&store, &config, &registry()).unwrap();

        assert_eq!(reports.len(), 4);
        assert_eq!(reports.iter().map(|r| r.claimed).sum::<usize>(), 30);
        assert_eq!(reports.iter().map(|r| r.failed).sum::<usize>(), 3);

        let mut ids: Vec<_> = reports.iter().map(|r| r.worker_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["local-0", "local-1", "local-2", "local-3"]);

        let counts = store.status_counts("pool").unwrap();
        assert_eq!(counts.complete, 27);
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.pending + counts.running, 0);

        for trial in store.trials_for_experiment("pool").unwrap() {
            assert!(trial.status.is_terminal());
            assert_ne!(trial.status, TrialStatus::Running);
        }
    }

    #[test]
    fn separate_connections_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:///{}", dir.path().join("pool.db").display());
        {
            let store = br_store::open_store(&url).unwrap();
            for _ in 0..12 {
                store.add_trial("pool", vec![run_asset("ok")]).unwrap();
            }
        }

        let config = WorkerConfig::new("pool", url.clone());
        let reports = LocalPool::new(3).run(&config, &registry()).unwrap();
        assert_eq!(reports.iter().map(|r| r.completed).sum::<usize>(), 12);

        let store = br_store::open_store(&url).unwrap();
        assert_eq!(store.status_counts("pool").unwrap().complete, 12);
    }
}
