//! Durable store-and-forward buffer on SQLite.
//!
//! Rows move `queued → in_flight → deleted` on success, or back to `queued`
//! on failure. Opening the buffer returns every `in_flight` row to `queued`,
//! so a crash mid-upload loses nothing.

use crate::domain::{now_timestamp, OutboundRecord};
use crate::error::{GatewayError, Result};
use crate::metrics::BufferMetrics;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

const STATUS_QUEUED: &str = "queued";
const STATUS_IN_FLIGHT: &str = "in_flight";

/// A row handed to the uplink by [`DurableBuffer::reserve_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub id: String,
    pub payload: Value,
    pub created_at: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub queued: u64,
    pub in_flight: u64,
}

pub struct DurableBuffer {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl DurableBuffer {
    /// Open (or create) the buffer at `path` and recover interrupted uploads.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            CREATE TABLE IF NOT EXISTS buffer (
                id            TEXT PRIMARY KEY,
                created_at    TEXT NOT NULL,
                payload       TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'queued',
                attempt_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS buffer_status_created ON buffer (status, created_at);
            "#,
        )?;

        let recovered = conn.execute(
            "UPDATE buffer SET status = ?1 WHERE status = ?2",
            params![STATUS_QUEUED, STATUS_IN_FLIGHT],
        )?;
        if recovered > 0 {
            warn!("Buffer: reset {} in-flight records to queued", recovered);
            BufferMetrics::record_recovered(recovered);
        }
        info!("Buffer: opened {}", path.display());

        Ok(Self { path, conn: Mutex::new(Some(conn)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard: MutexGuard<'_, Option<Connection>> = self
            .conn
            .lock()
            .map_err(|_| GatewayError::Config("buffer lock poisoned".into()))?;
        let conn = guard.as_mut().ok_or(GatewayError::BufferClosed)?;
        f(conn)
    }

    /// Store a record unless its idempotency id is already present. Returns
    /// whether a row was inserted.
    pub fn enqueue(&self, record: &OutboundRecord) -> Result<bool> {
        let payload = serde_json::to_string(record)?;
        let inserted = self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO buffer (id, created_at, payload, status, attempt_count)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![record.idempotency_id(), now_timestamp(), payload, STATUS_QUEUED],
            )?;
            Ok(n > 0)
        })?;
        BufferMetrics::record_enqueue(inserted);
        Ok(inserted)
    }

    /// Enqueue several records in one transaction. Returns how many were new.
    pub fn enqueue_all(&self, records: &[OutboundRecord]) -> Result<usize> {
        let payloads = records
            .iter()
            .map(|r| Ok((r.idempotency_id(), serde_json::to_string(r)?)))
            .collect::<Result<Vec<_>>>()?;
        let created_at = now_timestamp();
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO buffer (id, created_at, payload, status, attempt_count)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                )?;
                for (id, payload) in &payloads {
                    let n = stmt.execute(params![id, created_at, payload, STATUS_QUEUED])?;
                    BufferMetrics::record_enqueue(n > 0);
                    inserted += n;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Atomically move up to `limit` of the oldest queued rows to in_flight,
    /// incrementing their attempt counts.
    pub fn reserve_batch(&self, limit: usize) -> Result<Vec<BufferedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows: Vec<(String, String, String, u32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, payload, created_at, attempt_count FROM buffer
                     WHERE status = ?1 ORDER BY created_at, rowid LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![STATUS_QUEUED, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get::<_, i64>(3)? as u32))
                })?;
                mapped.collect::<std::result::Result<_, _>>()?
            };

            let mut batch = Vec::with_capacity(rows.len());
            for (id, payload, created_at, attempts) in rows {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => {
                        tx.execute(
                            "UPDATE buffer SET status = ?1, attempt_count = attempt_count + 1 WHERE id = ?2",
                            params![STATUS_IN_FLIGHT, id],
                        )?;
                        batch.push(BufferedRecord { id, payload: value, created_at, attempt_count: attempts + 1 });
                    }
                    Err(e) => {
                        warn!(id = %id, "Buffer: dropping unreadable payload: {}", e);
                        tx.execute("DELETE FROM buffer WHERE id = ?1", params![id])?;
                    }
                }
            }
            tx.commit()?;
            Ok(batch)
        })
    }

    /// Delete delivered rows.
    pub fn mark_sent<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize> {
        self.for_each_id(ids, "DELETE FROM buffer WHERE id = ?1")
    }

    /// Return reserved rows to the queue after a failed attempt.
    pub fn release<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize> {
        self.for_each_id(ids, "UPDATE buffer SET status = 'queued' WHERE id = ?1 AND status = 'in_flight'")
    }

    fn for_each_id<S: AsRef<str>>(&self, ids: &[S], sql: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(sql)?;
                for id in ids {
                    changed += stmt.execute(params![id.as_ref()])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    pub fn stats(&self) -> Result<BufferStats> {
        let stats = self.with_conn(|conn| {
            let count = |status: &str| -> Result<u64> {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM buffer WHERE status = ?1", params![status], |r| r.get(0))?;
                Ok(n as u64)
            };
            Ok(BufferStats { queued: count(STATUS_QUEUED)?, in_flight: count(STATUS_IN_FLIGHT)? })
        })?;
        BufferMetrics::record_depth(stats.queued, stats.in_flight);
        Ok(stats)
    }

    /// Attempt count of one row, if present.
    pub fn attempts(&self, id: &str) -> Result<Option<u32>> {
        self.with_conn(|conn| {
            let n: Option<i64> = conn
                .query_row("SELECT attempt_count FROM buffer WHERE id = ?1", params![id], |r| r.get(0))
                .optional()?;
            Ok(n.map(|n| n as u32))
        })
    }

    /// Checkpoint the WAL and release the connection. Later calls fail with
    /// [`GatewayError::BufferClosed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| GatewayError::Config("buffer lock poisoned".into()))?;
        if let Some(conn) = guard.take() {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            conn.close().map_err(|(_, e)| GatewayError::Store(e))?;
            info!("Buffer: closed {}", self.path.display());
        }
        Ok(())
    }
}
