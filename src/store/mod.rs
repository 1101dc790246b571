// Session and record persistence
//
// All statements run on the blocking pool against a single shared connection,
// so a slow disk never stalls the async side.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::session::{
    CaptureSession, EndOutcome, NewRecord, RecordFilter, SessionId, TrafficRecord,
};
use crate::utils::error::{AppError, AppResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    interface_name  TEXT    NOT NULL,
    start_time      INTEGER NOT NULL,
    end_time        INTEGER,
    avg_in          REAL    NOT NULL DEFAULT 0,
    avg_out         REAL    NOT NULL DEFAULT 0,
    max_in          REAL    NOT NULL DEFAULT 0,
    max_out         REAL    NOT NULL DEFAULT 0,
    total_in_bytes  INTEGER NOT NULL DEFAULT 0,
    total_out_bytes INTEGER NOT NULL DEFAULT 0,
    record_count    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS records (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    in_rate      REAL    NOT NULL,
    out_rate     REAL    NOT NULL,
    in_bytes     INTEGER NOT NULL DEFAULT 0,
    out_bytes    INTEGER NOT NULL DEFAULT 0,
    src_addr     TEXT,
    dst_addr     TEXT,
    process_name TEXT,
    protocol     TEXT,
    record_time  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_session_time ON records(session_id, record_time);
";

const SESSION_COLUMNS: &str = "id, interface_name, start_time, end_time, avg_in, avg_out, \
     max_in, max_out, total_in_bytes, total_out_bytes, record_count";

const RECORD_COLUMNS: &str = "id, session_id, in_rate, out_rate, in_bytes, out_bytes, \
     src_addr, dst_addr, process_name, protocol, record_time";

/// Tracks consecutive append failures
#[derive(Debug, Default)]
struct StoreHealth {
    consecutive_failures: AtomicU32,
    failed_writes: AtomicU64,
}

/// Persistent session history
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    health: Arc<StoreHealth>,
    degraded_after: u32,
}

impl SessionStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>, degraded_after: u32) -> AppResult<Self> {
        let path = path.as_ref();
        info!("Opening session database at {}", path.display());
        Self::init(Connection::open(path)?, degraded_after)
    }

    /// Private database that disappears with the store
    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?, 3)
    }

    fn init(conn: Connection, degraded_after: u32) -> AppResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            health: Arc::new(StoreHealth::default()),
            degraded_after: degraded_after.max(1),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock())).await?
    }

    /// Create an open-ended session and return its id
    pub async fn start_session(&self, interface_name: &str) -> AppResult<SessionId> {
        let interface_name = interface_name.to_string();
        let now = Utc::now();

        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (interface_name, start_time) VALUES (?1, ?2)",
                    params![interface_name, now.timestamp_millis()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        info!("Started session {}", id);
        Ok(id)
    }

    /// Append one window sample to a session
    ///
    /// Failures are counted toward the degraded status; a success resets it.
    /// An ended session takes no more records, so its aggregates stay exact.
    pub async fn append_record(&self, session_id: SessionId, record: NewRecord) -> AppResult<i64> {
        let result = self
            .with_conn(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO records (session_id, in_rate, out_rate, in_bytes, out_bytes, \
                     src_addr, dst_addr, process_name, protocol, record_time) \
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10 \
                     WHERE NOT EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND end_time IS NOT NULL)",
                    params![
                        session_id,
                        record.in_rate,
                        record.out_rate,
                        record.in_bytes as i64,
                        record.out_bytes as i64,
                        record.src_addr,
                        record.dst_addr,
                        record.process_name,
                        record.protocol.map(|p| p.as_str()),
                        record.record_time.timestamp_millis(),
                    ],
                )?;
                if inserted == 0 {
                    return Err(AppError::SessionClosed(session_id));
                }
                Ok(conn.last_insert_rowid())
            })
            .await;

        match &result {
            Ok(_) => self.note_success(),
            Err(AppError::SessionClosed(_)) => debug!("Dropped record for closed session {}", session_id),
            Err(e) => self.note_failure(session_id, e),
        }
        result
    }

    fn note_success(&self) {
        let previous = self.health.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.degraded_after {
            info!("Session store recovered after {} failed writes", previous);
        }
    }

    fn note_failure(&self, session_id: SessionId, err: &dyn std::fmt::Display) {
        self.health.failed_writes.fetch_add(1, Ordering::Relaxed);
        let failures = self.health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        warn!("Failed to append record to session {}: {}", session_id, err);
        if failures == self.degraded_after {
            error!("Session store degraded: {} consecutive writes failed", failures);
        }
    }

    /// Whether recent writes keep failing
    pub fn is_degraded(&self) -> bool {
        self.health.consecutive_failures.load(Ordering::SeqCst) >= self.degraded_after
    }

    /// Total failed appends since the store was opened
    pub fn failed_writes(&self) -> u64 {
        self.health.failed_writes.load(Ordering::Relaxed)
    }

    /// Close a session and recompute its aggregates from its records
    ///
    /// Ending twice keeps the first end time. An unknown id is reported, not raised.
    pub async fn end_session(&self, session_id: SessionId) -> AppResult<EndOutcome> {
        let now = Utc::now();

        let outcome = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE sessions SET
                        end_time        = COALESCE(end_time, ?2),
                        avg_in          = (SELECT COALESCE(AVG(in_rate), 0)    FROM records WHERE session_id = ?1),
                        avg_out         = (SELECT COALESCE(AVG(out_rate), 0)   FROM records WHERE session_id = ?1),
                        max_in          = (SELECT COALESCE(MAX(in_rate), 0)    FROM records WHERE session_id = ?1),
                        max_out         = (SELECT COALESCE(MAX(out_rate), 0)   FROM records WHERE session_id = ?1),
                        total_in_bytes  = (SELECT COALESCE(SUM(in_bytes), 0)   FROM records WHERE session_id = ?1),
                        total_out_bytes = (SELECT COALESCE(SUM(out_bytes), 0)  FROM records WHERE session_id = ?1),
                        record_count    = (SELECT COUNT(*)                     FROM records WHERE session_id = ?1)
                     WHERE id = ?1",
                    params![session_id, now.timestamp_millis()],
                )?;

                if updated == 0 {
                    return Ok(EndOutcome::NotFound);
                }

                let session = tx.query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                    [session_id],
                    session_from_row,
                )?;
                tx.commit()?;
                Ok(EndOutcome::Ended(session))
            })
            .await?;

        match &outcome {
            EndOutcome::Ended(session) => info!(
                "Ended session {} ({} records, avg in {:.1} B/s, avg out {:.1} B/s)",
                session.id, session.record_count, session.avg_in, session.avg_out
            ),
            EndOutcome::NotFound => warn!("Cannot end session {}: not found", session_id),
        }
        Ok(outcome)
    }

    pub async fn get_session(&self, session_id: SessionId) -> AppResult<Option<CaptureSession>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                    [session_id],
                    session_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// All sessions, most recent first
    pub async fn list_sessions(&self) -> AppResult<Vec<CaptureSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions ORDER BY start_time DESC, id DESC",
                SESSION_COLUMNS
            ))?;
            let sessions = stmt
                .query_map([], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
        .await
    }

    /// Records of a session in capture order, optionally filtered
    pub async fn get_records(
        &self,
        session_id: SessionId,
        filter: Option<&RecordFilter>,
    ) -> AppResult<Vec<TrafficRecord>> {
        let mut sql = format!("SELECT {} FROM records WHERE session_id = ?", RECORD_COLUMNS);
        let mut values = vec![Value::Integer(session_id)];

        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            if !filter.protocols.is_empty() {
                let placeholders = vec!["?"; filter.protocols.len()].join(", ");
                sql.push_str(&format!(" AND protocol IN ({})", placeholders));
                values.extend(filter.protocols.iter().map(|p| Value::Text(p.as_str().to_string())));
            }
            if let Some(name) = &filter.process_name {
                sql.push_str(" AND process_name = ?");
                values.push(Value::Text(name.clone()));
            }
            if let Some(min) = filter.min_in_rate {
                sql.push_str(" AND in_rate >= ?");
                values.push(Value::Real(min));
            }
        }
        sql.push_str(" ORDER BY record_time ASC, id ASC");
        debug!("Record query: {}", sql);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(values), record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Delete sessions together with their records; returns how many sessions went
    pub async fn delete_sessions(&self, ids: &[SessionId]) -> AppResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();

        let deleted = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0;
                {
                    let mut stmt = tx.prepare("DELETE FROM sessions WHERE id = ?1")?;
                    for id in &ids {
                        deleted += stmt.execute([id])?;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await?;

        info!("Deleted {} sessions", deleted);
        Ok(deleted)
    }
}

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<CaptureSession> {
    Ok(CaptureSession {
        id: row.get(0)?,
        interface_name: row.get(1)?,
        start_time: millis_to_time(row.get(2)?),
        end_time: row.get::<_, Option<i64>>(3)?.map(millis_to_time),
        avg_in: row.get(4)?,
        avg_out: row.get(5)?,
        max_in: row.get(6)?,
        max_out: row.get(7)?,
        total_in_bytes: row.get::<_, i64>(8)? as u64,
        total_out_bytes: row.get::<_, i64>(9)? as u64,
        record_count: row.get::<_, i64>(10)? as u64,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TrafficRecord> {
    Ok(TrafficRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        in_rate: row.get(2)?,
        out_rate: row.get(3)?,
        in_bytes: row.get::<_, i64>(4)? as u64,
        out_bytes: row.get::<_, i64>(5)? as u64,
        src_addr: row.get(6)?,
        dst_addr: row.get(7)?,
        process_name: row.get(8)?,
        protocol: row
            .get::<_, Option<String>>(9)?
            .and_then(|p| p.parse().ok()),
        record_time: millis_to_time(row.get(10)?),
    })
}
