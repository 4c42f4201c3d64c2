use std::path::Path;
use std::time::Duration;

use br_types::{Asset, StatusCounts, StoreError, StoreResult, Trial, TrialId, TrialStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::TrialStore;

/// How long a connection waits on another writer's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS trials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        status TEXT NOT NULL,
        worker_id TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_trials_status ON trials(status, id);
    CREATE INDEX IF NOT EXISTS idx_trials_experiment ON trials(experiment_id);

    CREATE TABLE IF NOT EXISTS assets (
        trial_id INTEGER NOT NULL REFERENCES trials(id),
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        mimetype TEXT NOT NULL,
        embedded BLOB NOT NULL,
        PRIMARY KEY (trial_id, position)
    );";

const TRIAL_COLUMNS: &str =
    "id, experiment_id, status, worker_id, error_message, created_at, started_at, ended_at";

fn query_failed(query: &str) -> impl FnOnce(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed {
        query: query.to_string(),
        error: e.to_string(),
    }
}

fn connection_failed(e: rusqlite::Error) -> StoreError {
    StoreError::DatabaseConnection {
        message: e.to_string(),
    }
}

/// SQLite-backed trial store.
///
/// Several processes may open the same database file; claims are serialized
/// by SQLite's write lock.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(connection_failed)?;
        tracing::debug!("Opened SQLite trial store at {}", path.as_ref().display());
        Self::bootstrap(conn)
    }

    /// Private in-memory database; not visible to other connections.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(connection_failed)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(connection_failed)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(connection_failed)?;
        conn.execute_batch(SCHEMA).map_err(connection_failed)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_trial(conn: &Connection, id: TrialId) -> StoreResult<Option<Trial>> {
        let query = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = ?1");
        let trial = conn
            .query_row(&query, params![id.0], read_trial_row)
            .optional()
            .map_err(query_failed(&query))?;

        let Some(trial) = trial else {
            return Ok(None);
        };
        let mut trial = trial?;
        trial.input_assets = Self::load_assets(conn, id)?;
        Ok(Some(trial))
    }

    fn load_assets(conn: &Connection, id: TrialId) -> StoreResult<Vec<Asset>> {
        let query = "SELECT name, mimetype, embedded FROM assets WHERE trial_id = ?1 ORDER BY position";
        let mut stmt = conn.prepare(query).map_err(query_failed(query))?;
        let rows = stmt
            .query_map(params![id.0], |row| {
                Ok(Asset {
                    name: row.get(0)?,
                    mimetype: row.get(1)?,
                    embedded: row.get(2)?,
                })
            })
            .map_err(query_failed(query))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(query_failed(query))
    }
}

/// Decode a trial row. The outer error is SQLite's; the inner one flags values
/// SQLite returned fine but the ledger cannot interpret.
fn read_trial_row(row: &Row<'_>) -> rusqlite::Result<StoreResult<Trial>> {
    let id = TrialId(row.get(0)?);
    let status: String = row.get(2)?;
    let status = match status.parse::<TrialStatus>() {
        Ok(status) => status,
        Err(message) => return Ok(Err(StoreError::Corruption { trial_id: id, message })),
    };

    Ok(Ok(Trial {
        id,
        experiment_id: row.get(1)?,
        status,
        input_assets: Vec::new(),
        worker_id: row.get(3)?,
        error_message: row.get(4)?,
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
    }))
}

impl TrialStore for SqliteStore {
    fn pick_trial(&self, worker_id: &str) -> StoreResult<Option<TrialId>> {
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock up front, so no other connection can
        // claim between our SELECT and UPDATE.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(connection_failed)?;

        let select = "SELECT id FROM trials WHERE status = ?1 ORDER BY id LIMIT 1";
        let candidate: Option<i64> = tx
            .query_row(select, params![TrialStatus::Pending.as_str()], |row| row.get(0))
            .optional()
            .map_err(query_failed(select))?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let update = "UPDATE trials SET status = ?1, worker_id = ?2, started_at = ?3
                      WHERE id = ?4 AND status = ?5";
        let claimed = tx
            .execute(
                update,
                params![
                    TrialStatus::Running.as_str(),
                    worker_id,
                    Utc::now(),
                    id,
                    TrialStatus::Pending.as_str()
                ],
            )
            .map_err(query_failed(update))?;

        if claimed != 1 {
            return Err(StoreError::Corruption {
                trial_id: TrialId(id),
                message: "pending trial changed while the write lock was held".to_string(),
            });
        }

        tx.commit().map_err(connection_failed)?;
        tracing::debug!(trial_id = id, worker_id, "Claimed trial");
        Ok(Some(TrialId(id)))
    }

    fn find_trial_by_id(&self, id: TrialId) -> StoreResult<Option<Trial>> {
        let conn = self.conn.lock();
        Self::load_trial(&conn, id)
    }

    fn end_trial(&self, id: TrialId, error_message: Option<&str>) -> StoreResult<bool> {
        let status = match error_message {
            None => TrialStatus::Complete,
            Some(_) => TrialStatus::Failed,
        };

        let update = "UPDATE trials SET status = ?1, error_message = ?2, ended_at = ?3
                      WHERE id = ?4 AND status = ?5";
        let changed = self
            .conn
            .lock()
            .execute(
                update,
                params![
                    status.as_str(),
                    error_message,
                    Utc::now(),
                    id.0,
                    TrialStatus::Running.as_str()
                ],
            )
            .map_err(query_failed(update))?;

        Ok(changed == 1)
    }

    fn add_trial(&self, experiment_id: &str, assets: Vec<Asset>) -> StoreResult<TrialId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(connection_failed)?;

        let insert = "INSERT INTO trials (experiment_id, status, created_at) VALUES (?1, ?2, ?3)";
        tx.execute(
            insert,
            params![experiment_id, TrialStatus::Pending.as_str(), Utc::now()],
        )
        .map_err(query_failed(insert))?;
        let id = tx.last_insert_rowid();

        let insert_asset = "INSERT INTO assets (trial_id, position, name, mimetype, embedded)
                            VALUES (?1, ?2, ?3, ?4, ?5)";
        for (position, asset) in assets.iter().enumerate() {
            tx.execute(
                insert_asset,
                params![id, position as i64, asset.name, asset.mimetype, asset.embedded],
            )
            .map_err(query_failed(insert_asset))?;
        }

        tx.commit().map_err(connection_failed)?;
        Ok(TrialId(id))
    }

    fn trials_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<Trial>> {
        let conn = self.conn.lock();
        let query = "SELECT id FROM trials WHERE experiment_id = ?1 ORDER BY id";
        let ids = {
            let mut stmt = conn.prepare(query).map_err(query_failed(query))?;
            let rows = stmt
                .query_map(params![experiment_id], |row| row.get::<_, i64>(0))
                .map_err(query_failed(query))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(query_failed(query))?
        };

        let mut trials = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(trial) = Self::load_trial(&conn, TrialId(id))? {
                trials.push(trial);
            }
        }
        Ok(trials)
    }

    fn status_counts(&self, experiment_id: &str) -> StoreResult<StatusCounts> {
        let conn = self.conn.lock();
        let query = "SELECT status, COUNT(*) FROM trials WHERE experiment_id = ?1 GROUP BY status";
        let mut stmt = conn.prepare(query).map_err(query_failed(query))?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(query_failed(query))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row.map_err(query_failed(query))?;
            let n = count as usize;
            match status.parse::<TrialStatus>() {
                Ok(TrialStatus::Pending) => counts.pending += n,
                Ok(TrialStatus::Running) => counts.running += n,
                Ok(TrialStatus::Complete) => counts.complete += n,
                Ok(TrialStatus::Failed) => counts.failed += n,
                Err(message) => {
                    tracing::warn!("Skipping unknown status in experiment {}: {}", experiment_id, message);
                }
            }
        }
        Ok(counts)
    }

    fn stale_running(&self, older_than: chrono::Duration) -> StoreResult<Vec<TrialId>> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let query = "SELECT id, started_at FROM trials WHERE status = ?1 ORDER BY id";
        let mut stmt = conn.prepare(query).map_err(query_failed(query))?;
        let rows = stmt
            .query_map(params![TrialStatus::Running.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<DateTime<Utc>>>(1)?))
            })
            .map_err(query_failed(query))?;

        let mut stale = Vec::new();
        for row in rows {
            let (id, started_at) = row.map_err(query_failed(query))?;
            if started_at.map_or(true, |started| started <= cutoff) {
                stale.push(TrialId(id));
            }
        }
        Ok(stale)
    }
}
