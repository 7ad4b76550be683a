//! Embedded SQLite store for experiments, metadata, variables and records.
//!
//! # SQLite settings
//! Applied at open: WAL (file-backed only), synchronous=FULL,
//! foreign_keys=ON. PRAGMA integrity_check runs for file-backed databases;
//! a failure refuses the open.
//!
//! # Locking
//! One connection lives behind one mutex. The experiment interface's quick
//! lifecycle calls and the writer worker's chunk commits serialize on it;
//! this is also what makes `:memory:` engines work, where a second
//! connection would see a different database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A new record row handed to `insert_records`.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub variable_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

/// One row of the record export join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub experiment: Uuid,
    /// Stored RFC 3339 text; already sortable.
    pub timestamp: String,
    pub variable: String,
    pub value: String,
}

/// Start/end pair of one experiment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentTimes {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    /// `None` once `close` has run.
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        run_integrity_check(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an in-memory store (tests and non-persistent runs).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Checkpoint and close the connection.
    ///
    /// Flushes the WAL back into the main file (`wal_checkpoint(TRUNCATE)`)
    /// so a clean close leaves no live `-wal`/`-shm` sidecars behind. Any
    /// store call after this fails with `StoreError::Closed`.
    pub fn close(&self) -> StoreResult<()> {
        let conn = self
            .conn
            .lock()
            .expect("store lock poisoned")
            .take()
            .ok_or(StoreError::Closed)?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().expect("store lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Experiment lifecycle
    // -----------------------------------------------------------------------

    /// Create an experiment instance with a server-assigned id and
    /// `started_at = now`.
    pub fn create_experiment(&self) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "INSERT INTO experiment_instances (id, started_at, ended_at)
             VALUES (?1, ?2, NULL)",
            params![id.to_string(), fmt_ts(&Utc::now())],
        )?;
        Ok(id)
    }

    /// Set the end time of an experiment instance.
    pub fn finish_experiment(&self, id: Uuid, end: DateTime<Utc>) -> StoreResult<()> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "UPDATE experiment_instances SET ended_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_ts(&end)],
        )?;
        Ok(())
    }

    /// Insert or update one metadata pair for an instance.
    pub fn upsert_metadata(&self, id: Uuid, label: &str, value: &str) -> StoreResult<()> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "INSERT INTO experiment_metadata (instance_id, label, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (instance_id, label) DO UPDATE SET value = excluded.value",
            params![id.to_string(), label, value],
        )?;
        Ok(())
    }

    /// Return the variable id for (instance, name), creating the row on
    /// first use. Idempotent.
    pub fn ensure_variable(&self, instance_id: Uuid, name: &str) -> StoreResult<Uuid> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM instance_variables WHERE instance_id = ?1 AND name = ?2",
                params![instance_id.to_string(), name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return parse_uuid(&id);
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO instance_variables (id, instance_id, name) VALUES (?1, ?2, ?3)",
            params![id.to_string(), instance_id.to_string(), name],
        )?;
        Ok(id)
    }

    /// Commit a batch of records in one transaction.
    pub fn insert_records(&self, rows: &[NewRecord]) -> StoreResult<()> {
        let mut guard = self.conn();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO variable_records (variable_id, timestamp, value)
                 VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.variable_id.to_string(),
                    fmt_ts(&row.timestamp),
                    row.value,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Export queries
    // -----------------------------------------------------------------------

    /// All record rows for the given experiments, ordered by
    /// (experiment, timestamp, variable).
    pub fn export_records(&self, ids: &[Uuid]) -> StoreResult<Vec<RecordRow>> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut out = Vec::new();
        for id in sorted(ids) {
            let mut stmt = conn.prepare(
                "SELECT v.name, r.timestamp, r.value
                 FROM variable_records r
                 JOIN instance_variables v ON r.variable_id = v.id
                 WHERE v.instance_id = ?1
                 ORDER BY r.timestamp ASC, v.name ASC",
            )?;
            let rows = stmt.query_map(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (variable, timestamp, value) = row?;
                out.push(RecordRow {
                    experiment: id,
                    timestamp,
                    variable,
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Metadata per experiment: instance → {label → value}.
    pub fn export_metadata(
        &self,
        ids: &[Uuid],
    ) -> StoreResult<BTreeMap<Uuid, BTreeMap<String, Option<String>>>> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut out = BTreeMap::new();
        for id in sorted(ids) {
            let mut stmt = conn.prepare(
                "SELECT label, value FROM experiment_metadata
                 WHERE instance_id = ?1 ORDER BY label ASC",
            )?;
            let rows = stmt.query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            let mut pairs = BTreeMap::new();
            for row in rows {
                let (label, value) = row?;
                pairs.insert(label, value);
            }
            out.insert(id, pairs);
        }
        Ok(out)
    }

    /// Start/end times per experiment. `end` is `None` until the instance
    /// finished cleanly.
    pub fn export_times(&self, ids: &[Uuid]) -> StoreResult<BTreeMap<Uuid, ExperimentTimes>> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut out = BTreeMap::new();
        for id in sorted(ids) {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT started_at, ended_at FROM experiment_instances WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((start, end)) = row {
                out.insert(
                    id,
                    ExperimentTimes {
                        start: parse_ts(&start)?,
                        end: end.as_deref().map(parse_ts).transpose()?,
                    },
                );
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

/// Canonical timestamp rendering for storage and artifacts.
pub fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid '{s}': {e}")))
}

fn sorted(ids: &[Uuid]) -> Vec<Uuid> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}
