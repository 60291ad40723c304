//! Durable outbound queue and delivery watermark, both worker-owned.
//!
//! The queue is the single place offline resilience lives: records go to
//! disk before the submitting page hears anything, and a worker evicted
//! between enqueue and replay finds them again on its next start. FIFO is
//! by rowid; retention is 24 hours per record.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection};

use crate::store::kv::KvStore;
use crate::types::{SearchResult, SyncSubmission};
use crate::util::now_ms;

/// Maximum time a record may wait for delivery.
pub const QUEUE_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Worker KV key holding the delivery watermark.
pub const LAST_SYNC_KEY: &str = "syncStore/lastSyncTimestamp";

/// A queued submission with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub id: i64,
    pub submission: SyncSubmission,
    /// How many 4xx answers this record has seen.
    pub refusals: u32,
}

/// SQLite-backed FIFO of pending submissions.
pub struct SyncQueue {
    db_path: PathBuf,
    retention_ms: i64,
}

impl SyncQueue {
    /// Open (and initialize if needed) the queue at `db_path` with the
    /// standard 24-hour retention.
    pub fn new(db_path: PathBuf) -> Result<Self, anyhow::Error> {
        Self::with_retention(db_path, QUEUE_RETENTION_MS)
    }

    pub fn with_retention(db_path: PathBuf, retention_ms: i64) -> Result<Self, anyhow::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let queue = Self {
            db_path,
            retention_ms,
        };
        queue.initialize_db()?;
        Ok(queue)
    }

    fn initialize_db(&self) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhook_sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_url TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueue_time INTEGER NOT NULL,
                refusals INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }

    /// Append a record. `refusals` is non-zero when the record already saw
    /// a live 4xx before being queued.
    pub fn push(&self, submission: &SyncSubmission, refusals: u32) -> Result<i64, anyhow::Error> {
        let payload_json = serde_json::to_string(&submission.payload)?;
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO webhook_sync_queue (webhook_url, payload, enqueue_time, refusals)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                submission.webhook_url,
                payload_json,
                submission.enqueue_time,
                refusals as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The head of the queue, if any.
    pub fn peek(&self) -> Result<Option<QueueRecord>, anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, webhook_url, payload, enqueue_time, refusals
             FROM webhook_sync_queue ORDER BY id ASC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let payload_json: String = row.get(2)?;
                let refusals: i64 = row.get(4)?;
                Ok(Some(QueueRecord {
                    id: row.get(0)?,
                    submission: SyncSubmission {
                        webhook_url: row.get(1)?,
                        payload: serde_json::from_str(&payload_json)?,
                        enqueue_time: row.get(3)?,
                    },
                    refusals: refusals as u32,
                }))
            }
            None => Ok(None),
        }
    }

    /// Remove one record by id.
    pub fn remove(&self, id: i64) -> Result<(), anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute("DELETE FROM webhook_sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Count a 4xx answer against a record, returning the new total.
    pub fn record_refusal(&self, id: i64) -> Result<u32, anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "UPDATE webhook_sync_queue SET refusals = refusals + 1 WHERE id = ?1",
            params![id],
        )?;
        let refusals: i64 = conn.query_row(
            "SELECT refusals FROM webhook_sync_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(refusals as u32)
    }

    pub fn len(&self) -> Result<usize, anyhow::Error> {
        let conn = Connection::open(&self.db_path)?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM webhook_sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, anyhow::Error> {
        Ok(self.len()? == 0)
    }

    /// Drop records older than the retention window. Returns how many
    /// were removed.
    pub fn drop_expired(&self, now: i64) -> Result<usize, anyhow::Error> {
        let cutoff = now - self.retention_ms;
        let conn = Connection::open(&self.db_path)?;
        let dropped = conn.execute(
            "DELETE FROM webhook_sync_queue WHERE enqueue_time < ?1",
            params![cutoff],
        )?;
        Ok(dropped)
    }
}

/// Delivery watermark over the worker KV.
///
/// Advanced only after a webhook acceptance, and only by payload entries
/// with timestamps newer than the stored value.
pub struct SyncCursor {
    kv: Arc<dyn KvStore>,
}

impl SyncCursor {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The stored watermark in milliseconds; 0 when unset or unreadable.
    pub fn get(&self) -> i64 {
        match self.kv.get(LAST_SYNC_KEY) {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                log::warn!("failed to read sync cursor: {e}");
                0
            }
        }
    }

    /// Advance past the delivered entries. An explicit loop with both
    /// sides normalized to milliseconds; entry timestamps observed in
    /// seconds are scaled up before comparison.
    pub fn advance(&self, delivered: &[SearchResult]) -> i64 {
        let mut cursor = normalize_ms(self.get());
        for entry in delivered {
            let ts = normalize_ms(entry.timestamp);
            if ts > cursor {
                cursor = ts;
            }
        }
        if let Err(e) = self.kv.put(LAST_SYNC_KEY, &cursor.to_string()) {
            log::warn!("failed to persist sync cursor: {e}");
        }
        cursor
    }
}

/// Timestamps below this are assumed to be seconds, not milliseconds.
const MS_THRESHOLD: i64 = 100_000_000_000;

fn normalize_ms(ts: i64) -> i64 {
    if ts > 0 && ts < MS_THRESHOLD {
        ts * 1000
    } else {
        ts
    }
}
