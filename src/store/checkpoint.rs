//! Per-repository polling checkpoints (`svn_checkpoints`).

use super::{Database, format_ts, parse_ts};
use crate::error::StoreError;
use crate::types::{Checkpoint, Window};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{OptionalExtension, Row, params};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS svn_checkpoints (
    repo_name TEXT PRIMARY KEY,
    last_check_time TEXT NOT NULL,
    last_revision TEXT,
    updated_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);";

const COLUMNS: &str = "repo_name, last_check_time, last_revision, updated_at, created_at";

/// Data access object for checkpoints
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    /// Create the store, initializing its table if needed
    pub fn new(db: Database) -> Result<Self, StoreError> {
        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    /// Idempotent schema creation
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.db.with_connection(|conn| Ok(conn.execute_batch(SCHEMA)?))
    }

    pub fn get(&self, repo_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_connection(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM svn_checkpoints WHERE repo_name = ?1", COLUMNS),
                    params![repo_name],
                    RawCheckpoint::from_row,
                )
                .optional()?;
            raw.map(RawCheckpoint::into_checkpoint).transpose()
        })
    }

    /// Next polling window: from the stored check time (or `now - default_lookback`) to now
    pub fn get_window(&self, repo_name: &str, default_lookback: Duration) -> Result<Window, StoreError> {
        // Stored times have microsecond precision; keep `until` exactly representable
        self.get_window_at(repo_name, default_lookback, Utc::now().trunc_subsecs(6))
    }

    /// [`CheckpointStore::get_window`] with an explicit clock
    pub fn get_window_at(
        &self,
        repo_name: &str,
        default_lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Window, StoreError> {
        let since = match self.get(repo_name)? {
            Some(checkpoint) => checkpoint.last_check_time,
            None => now - default_lookback,
        };
        Ok(Window { since, until: now })
    }

    /// Mark the repository as checked up to now
    pub fn advance(&self, repo_name: &str, last_revision_seen: Option<&str>) -> Result<(), StoreError> {
        self.advance_to(repo_name, last_revision_seen, Utc::now())
    }

    /// Mark the repository as checked up to `checked_until`
    ///
    /// Single-statement upsert. The stored check time never moves backwards, and a
    /// `None` revision (or an older check time) keeps the stored revision.
    pub fn advance_to(
        &self,
        repo_name: &str,
        last_revision_seen: Option<&str>,
        checked_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let checked = format_ts(checked_until);
        let now = format_ts(Utc::now());

        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO svn_checkpoints (repo_name, last_check_time, last_revision, updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(repo_name) DO UPDATE SET
                     last_revision = CASE
                         WHEN excluded.last_check_time >= svn_checkpoints.last_check_time
                         THEN COALESCE(excluded.last_revision, svn_checkpoints.last_revision)
                         ELSE svn_checkpoints.last_revision
                     END,
                     last_check_time = MAX(svn_checkpoints.last_check_time, excluded.last_check_time),
                     updated_at = excluded.updated_at",
                params![repo_name, checked, last_revision_seen, now],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            "Checkpoint for {} advanced to {} (revision {:?})",
            repo_name,
            checked,
            last_revision_seen
        );
        Ok(())
    }

    /// All checkpoints ordered by repository name
    pub fn list_all(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM svn_checkpoints ORDER BY repo_name",
                COLUMNS
            ))?;
            let raws = stmt
                .query_map([], RawCheckpoint::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawCheckpoint::into_checkpoint).collect()
        })
    }

    /// Delete one checkpoint so the next cycle starts from the default lookback
    pub fn reset(&self, repo_name: &str) -> Result<bool, StoreError> {
        let deleted = self.db.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM svn_checkpoints WHERE repo_name = ?1",
                params![repo_name],
            )?)
        })?;
        if deleted > 0 {
            tracing::info!("Reset checkpoint for {}", repo_name);
        }
        Ok(deleted > 0)
    }
}

struct RawCheckpoint {
    repo_name: String,
    last_check_time: String,
    last_revision: Option<String>,
    updated_at: String,
    created_at: String,
}

impl RawCheckpoint {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            repo_name: row.get(0)?,
            last_check_time: row.get(1)?,
            last_revision: row.get(2)?,
            updated_at: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        Ok(Checkpoint {
            repo_name: self.repo_name,
            last_check_time: parse_ts(&self.last_check_time)?,
            last_revision: self.last_revision,
            updated_at: parse_ts(&self.updated_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> CheckpointStore {
        CheckpointStore::new(Database::open_in_memory().unwrap()).unwrap()
    }

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_first_window_uses_default_lookback() {
        let store = store();
        let now = t(12);
        let window = store.get_window_at("payments", Duration::hours(24), now).unwrap();

        assert_eq!(window.since, now - Duration::hours(24));
        assert_eq!(window.until, now);
        assert!(store.get("payments").unwrap().is_none());
    }

    #[test]
    fn test_next_window_starts_at_last_check() {
        let store = store();
        store.advance_to("payments", Some("500"), t(9)).unwrap();

        let window = store.get_window_at("payments", Duration::hours(24), t(10)).unwrap();
        assert_eq!(window.since, t(9));
        assert_eq!(window.until, t(10));
    }

    #[test]
    fn test_window_stable_without_advance() {
        let store = store();
        store.advance_to("payments", None, t(9)).unwrap();

        let first = store.get_window("payments", Duration::hours(24)).unwrap();
        let second = store.get_window("payments", Duration::hours(24)).unwrap();
        assert_eq!(first.since, second.since);
    }

    #[test]
    fn test_windows_are_disjoint_across_advance() {
        let store = store();
        let first = store.get_window("payments", Duration::hours(24)).unwrap();
        store.advance_to("payments", None, first.until).unwrap();
        let second = store.get_window("payments", Duration::hours(24)).unwrap();

        assert!(second.since >= first.until);
    }

    #[test]
    fn test_check_time_is_monotonic() {
        let store = store();
        store.advance_to("payments", Some("510"), t(11)).unwrap();
        // late write from an older cycle
        store.advance_to("payments", Some("505"), t(10)).unwrap();

        let checkpoint = store.get("payments").unwrap().unwrap();
        assert_eq!(checkpoint.last_check_time, t(11));
        assert_eq!(checkpoint.last_revision.as_deref(), Some("510"));

        store.advance("payments", None).unwrap();
        let after = store.get("payments").unwrap().unwrap();
        assert!(after.last_check_time >= t(11));
    }

    #[test]
    fn test_none_revision_keeps_previous() {
        let store = store();
        store.advance_to("payments", Some("500"), t(9)).unwrap();
        store.advance_to("payments", None, t(10)).unwrap();

        let checkpoint = store.get("payments").unwrap().unwrap();
        assert_eq!(checkpoint.last_check_time, t(10));
        assert_eq!(checkpoint.last_revision.as_deref(), Some("500"));
        assert!(checkpoint.updated_at >= checkpoint.created_at);
    }

    #[test]
    fn test_list_all_and_reset() {
        let store = store();
        store.advance_to("zeta", None, t(9)).unwrap();
        store.advance_to("alpha", Some("3"), t(9)).unwrap();

        let names: Vec<String> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|c| c.repo_name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);

        assert!(store.reset("alpha").unwrap());
        assert!(!store.reset("alpha").unwrap());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_schema_init_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = CheckpointStore::new(db.clone()).unwrap();
        first.advance_to("payments", None, t(9)).unwrap();

        let second = CheckpointStore::new(db).unwrap();
        assert!(second.get("payments").unwrap().is_some());
    }
}
