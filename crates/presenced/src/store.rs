use chrono::NaiveDate;
use presence_core::{Ack, AttendanceSink, IdentityId, SinkError, StaticRoster, VerificationDecision};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("attendance already recorded for {identity} on {date}")]
    Duplicate { identity: IdentityId, date: NaiveDate },
    #[error("decision has no identity to record")]
    MissingIdentity,
}

/// One row of the attendance table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity_id: String,
    pub display_name: String,
    pub date: String,
    pub timestamp: String,
    pub checkpoint: String,
    pub track_id: i64,
    pub confidence: f64,
}

/// SQLite-backed attendance log and roster.
///
/// `UNIQUE(identity_id, date)` makes the database the last line of the
/// once-per-day rule: a second insert for the same person and day fails with
/// [`StoreError::Duplicate`] even across daemon restarts.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     identity_id TEXT NOT NULL,
                     display_name TEXT NOT NULL,
                     date TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     checkpoint TEXT NOT NULL,
                     track_id INTEGER NOT NULL,
                     confidence REAL NOT NULL,
                     UNIQUE(identity_id, date)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
                 CREATE TABLE IF NOT EXISTS roster (
                     identity_id TEXT PRIMARY KEY,
                     display_name TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Record an accepted decision. Returns the generated record id.
    pub async fn insert(
        &self,
        decision: &VerificationDecision,
        checkpoint: &str,
    ) -> Result<String, StoreError> {
        let identity = decision
            .identity_id
            .clone()
            .ok_or(StoreError::MissingIdentity)?;
        let date = decision.timestamp.date_naive();

        let id = uuid::Uuid::new_v4().to_string();
        let row = (
            id.clone(),
            identity.as_str().to_string(),
            decision
                .display_name
                .clone()
                .unwrap_or_else(|| identity.as_str().to_string()),
            date.to_string(),
            decision.timestamp.to_rfc3339(),
            checkpoint.to_string(),
            decision.track_id.0 as i64,
            decision.confidence.unwrap_or(0.0) as f64,
        );

        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO attendance
                         (id, identity_id, display_name, date, timestamp, checkpoint, track_id, confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::Duplicate { identity, date });
        }
        Ok(id)
    }

    /// Attendance records for a day, in commit order.
    pub async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, display_name, date, timestamp, checkpoint, track_id, confidence
                     FROM attendance WHERE date = ?1 ORDER BY timestamp",
                )?;
                let rows = stmt.query_map([&date], |row| {
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        display_name: row.get(2)?,
                        date: row.get(3)?,
                        timestamp: row.get(4)?,
                        checkpoint: row.get(5)?,
                        track_id: row.get(6)?,
                        confidence: row.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Identities already recorded on `date`, for seeding the dedup ledger.
    pub async fn accepted_on(&self, date: NaiveDate) -> Result<Vec<IdentityId>, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT identity_id FROM attendance WHERE date = ?1")?;
                let rows = stmt.query_map([&date], |row| row.get::<_, String>(0))?;
                Ok(rows
                    .map(|r| r.map(IdentityId::new))
                    .collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    #[cfg(test)]
    pub(crate) async fn drop_attendance_table(&self) {
        self.conn
            .call(|conn| {
                conn.execute_batch("DROP TABLE attendance")?;
                Ok(())
            })
            .await
            .unwrap();
    }

    pub async fn count_on(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    [&date],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert or rename roster entries. Returns the number of rows written.
    pub async fn upsert_roster(&self, entries: Vec<(IdentityId, String)>) -> Result<usize, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO roster (identity_id, display_name) VALUES (?1, ?2)
                         ON CONFLICT(identity_id) DO UPDATE SET display_name = excluded.display_name",
                    )?;
                    for (identity, name) in &entries {
                        written += stmt.execute([identity.as_str(), name.as_str()])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn roster(&self) -> Result<StaticRoster, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT identity_id, display_name FROM roster")?;
                let rows = stmt.query_map([], |row| {
                    Ok((IdentityId::new(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
                })?;
                Ok(rows.collect::<Result<StaticRoster, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// Attendance sink backed by [`AttendanceStore`].
///
/// The pipeline commits synchronously from the engine thread, so each commit
/// is driven to completion on the daemon's runtime with `block_on`. Must not
/// be called from inside an async task.
pub struct SqliteSink {
    store: AttendanceStore,
    checkpoint: String,
    runtime: Handle,
}

impl SqliteSink {
    pub fn new(store: AttendanceStore, checkpoint: impl Into<String>, runtime: Handle) -> Self {
        Self {
            store,
            checkpoint: checkpoint.into(),
            runtime,
        }
    }
}

impl AttendanceSink for SqliteSink {
    fn commit(&self, decision: &VerificationDecision) -> Result<Ack, SinkError> {
        let record_id = self
            .runtime
            .block_on(self.store.insert(decision, &self.checkpoint))
            .map_err(|e| match e {
                StoreError::Duplicate { identity, date } => {
                    SinkError::AlreadyRecorded { identity, date }
                }
                other => SinkError::Unavailable(other.to_string()),
            })?;
        tracing::debug!(record_id = %record_id, checkpoint = %self.checkpoint, "attendance row written");
        Ok(Ack { record_id })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
