//! Connection-string parsing.

use std::path::PathBuf;
use std::str::FromStr;

use br_types::{StoreError, StoreResult};

use crate::{MemoryStore, SqliteStore, TrialStore};

/// A parsed store connection string.
///
/// Accepted forms:
/// - `sqlite:///<path>`: SQLite database file. The path after the third
///   slash is taken as written, so `sqlite:///trials.db` is relative and
///   `sqlite:////var/lib/trials.db` is absolute.
/// - a bare filesystem path: SQLite database file
/// - `sqlite://`, `sqlite::memory:` or `sqlite:///:memory:`: private
///   in-memory SQLite
/// - `memory://`: private in-memory ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Sqlite(PathBuf),
    SqliteMemory,
    Memory,
}

impl FromStr for StoreUrl {
    type Err = StoreError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| StoreError::InvalidUrl {
            url: url.to_string(),
            message: message.to_string(),
        };

        let url = url.trim();
        if url.is_empty() {
            return Err(invalid("empty connection string"));
        }

        match url {
            "memory://" => return Ok(Self::Memory),
            "sqlite://" | "sqlite::memory:" | "sqlite:///:memory:" => {
                return Ok(Self::SqliteMemory)
            }
            _ => {}
        }

        if let Some(rest) = url.strip_prefix("sqlite://") {
            let Some(path) = rest.strip_prefix('/') else {
                return Err(invalid("expected sqlite:///<path>"));
            };
            if path.is_empty() {
                return Err(invalid("missing database path"));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }

        if let Some((scheme, _)) = url.split_once("://") {
            return Err(invalid(&format!("unsupported scheme '{scheme}'")));
        }

        Ok(Self::Sqlite(PathBuf::from(url)))
    }
}

impl StoreUrl {
    pub fn open(&self) -> StoreResult<Box<dyn TrialStore>> {
        let store: Box<dyn TrialStore> = match self {
            Self::Sqlite(path) => Box::new(SqliteStore::open(path)?),
            Self::SqliteMemory => Box::new(SqliteStore::open_in_memory()?),
            Self::Memory => Box::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

/// Open the store named by `url`.
pub fn open_store(url: &str) -> StoreResult<Box<dyn TrialStore>> {
    let parsed: StoreUrl = url.parse()?;
    tracing::info!("Opening trial store {:?}", parsed);
    parsed.open()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            "sqlite:////var/lib/bench/trials.db".parse::<StoreUrl>().unwrap(),
            StoreUrl::Sqlite(PathBuf::from("/var/lib/bench/trials.db"))
        );
        assert_eq!(
            "sqlite:///relative.db".parse::<StoreUrl>().unwrap(),
            StoreUrl::Sqlite(PathBuf::from("relative.db"))
        );
        assert_eq!(
            "sqlite:///runs/trials.db".parse::<StoreUrl>().unwrap(),
            StoreUrl::Sqlite(PathBuf::from("runs/trials.db"))
        );
        assert_eq!(
            "./trials.db".parse::<StoreUrl>().unwrap(),
            StoreUrl::Sqlite(PathBuf::from("./trials.db"))
        );
        for url in ["sqlite://", "sqlite::memory:", "sqlite:///:memory:"] {
            assert_eq!(url.parse::<StoreUrl>().unwrap(), StoreUrl::SqliteMemory);
        }
        assert_eq!("memory://".parse::<StoreUrl>().unwrap(), StoreUrl::Memory);
    }

    #[test]
    fn rejects_unusable_urls() {
        for url in [
            "",
            "  ",
            "sqlite:///",
            "sqlite://relative.db",
            "postgresql://db.internal/bench",
        ] {
            assert!(
                matches!(url.parse::<StoreUrl>(), Err(StoreError::InvalidUrl { .. })),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn opens_a_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:///{}", dir.path().join("t.db").display());

        let store = open_store(&url).unwrap();
        let id = store.add_trial("exp", vec![]).unwrap();
        assert!(store.find_trial_by_id(id).unwrap().is_some());
    }
}
