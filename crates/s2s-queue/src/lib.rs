//! Persistent packet queue -- rusqlite store with reservation markers.
//!
//! Packets are claimed in batches by stamping them with a reservation id.
//! A batch is resolved exactly once: `transaction_complete` deletes its rows,
//! `transaction_failed` returns them to the pool. Reservations that outlive
//! their expiry are treated as abandoned and released before the next claim.
//!
//! WAL mode + busy_timeout so a host process can share the file.

pub mod prioritizer;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use s2s_protocol::DataPacket;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub use prioritizer::{AttributePrioritizer, NoOpPrioritizer, Prioritizer};

const SCHEMA_VERSION: u32 = 1;

/// Stored in `expires_at` for packets that never expire.
pub const NEVER_EXPIRES: i64 = i64::MAX;

/// Rows inspected per round of the size-limit pass.
const CLEANUP_CHUNK: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("attribute encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Queue bounds and batch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum stored rows; `<= 0` disables the row-count pass.
    #[serde(default = "default_max_rows")]
    pub max_rows: i64,
    /// Maximum stored bytes (attributes + content); `<= 0` disables the size pass.
    #[serde(default = "default_max_size")]
    pub max_size: i64,
    /// Packets per dequeued batch.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// How long a claimed batch stays reserved before it counts as abandoned.
    #[serde(default = "default_reservation_ttl_ms")]
    pub reservation_ttl_ms: u64,
}

fn default_max_rows() -> i64 {
    10_000
}
fn default_max_size() -> i64 {
    100 * 1024 * 1024
}
fn default_batch_limit() -> usize {
    100
}
fn default_reservation_ttl_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_size: default_max_size(),
            batch_limit: default_batch_limit(),
            reservation_ttl_ms: default_reservation_ttl_ms(),
        }
    }
}

impl QueueConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }
}

/// One stored packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub id: i64,
    pub created_at: i64,
    pub priority: i64,
    pub expires_at: i64,
    pub packet: DataPacket,
}

/// Counts reported by `cleanup`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub expired: usize,
    pub over_row_limit: usize,
    pub over_size_limit: usize,
}

impl CleanupStats {
    pub fn total(&self) -> usize {
        self.expired + self.over_row_limit + self.over_size_limit
    }
}

/// Aggregate queue statistics for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub rows: u64,
    pub reserved_rows: u64,
    pub reservations: u64,
    pub stored_bytes: u64,
}

/// SQLite-backed queue.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    config: QueueConfig,
    prioritizer: Box<dyn Prioritizer>,
}

impl SqliteQueue {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the queue database at `db_path`.
    pub fn open(
        db_path: &Path,
        config: QueueConfig,
        prioritizer: Box<dyn Prioritizer>,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let queue = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            config,
            prioritizer,
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(path = %self.db_path.display(), "queue: created schema v1");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Store `packets` in one write transaction. Empty input writes nothing.
    pub fn enqueue(&self, packets: &[DataPacket]) -> Result<usize> {
        if packets.is_empty() {
            return Ok(0);
        }

        let now = Self::now_ms();
        let mut conn = self.db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO queued_packets (created_at, priority, attributes, content, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for packet in packets {
                let priority = self.prioritizer.priority(packet);
                let ttl = self.prioritizer.ttl_ms(packet);
                let expires_at = if ttl < 0 {
                    NEVER_EXPIRES
                } else {
                    now.saturating_add(ttl)
                };
                let attributes = serde_json::to_vec(packet.attributes())?;
                stmt.execute(params![
                    now,
                    priority,
                    attributes,
                    &packet.content()[..],
                    expires_at
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = packets.len(), "queue: enqueued packets");
        Ok(packets.len())
    }

    /// Drop reservations whose expiry has passed and return their rows to the pool.
    pub fn release_expired_reservations(&self) -> Result<usize> {
        let now = Self::now_ms();
        let mut conn = self.db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let released = release_expired(&tx, now)?;
        tx.commit()?;
        Ok(released)
    }

    /// Claim up to `limit` unreserved, unexpired packets as one batch.
    ///
    /// Expired reservations are released and the new claim is stamped in a
    /// single write transaction; rows are returned in claim order
    /// (priority desc, newest first).
    pub fn dequeue(&self, limit: usize) -> Result<Batch<'_>> {
        let now = Self::now_ms();
        let expires = now.saturating_add(self.config.reservation_ttl_ms as i64);

        let mut conn = self.db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        release_expired(&tx, now)?;

        tx.execute(
            "INSERT INTO reservations (created_at, expires_at) VALUES (?1, ?2)",
            params![now, expires],
        )?;
        let reservation_id = tx.last_insert_rowid();

        let claimed = tx.execute(
            "UPDATE queued_packets SET reservation_id = ?1
             WHERE id IN (
                 SELECT id FROM queued_packets
                 WHERE reservation_id IS NULL AND expires_at > ?2
                 ORDER BY priority DESC, created_at DESC, id DESC
                 LIMIT ?3
             )",
            params![reservation_id, now, limit as i64],
        )?;

        if claimed == 0 {
            tx.execute("DELETE FROM reservations WHERE id = ?1", params![reservation_id])?;
            tx.commit()?;
            return Ok(Batch {
                queue: self,
                reservation_id: None,
                records: Vec::new(),
            });
        }

        let records = {
            let mut stmt = tx.prepare(
                "SELECT id, created_at, priority, expires_at, attributes, content
                 FROM queued_packets
                 WHERE reservation_id = ?1
                 ORDER BY priority DESC, created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![reservation_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, created_at, priority, expires_at, attrs, content)| {
                    let attributes: BTreeMap<String, String> = serde_json::from_slice(&attrs)?;
                    Ok(QueuedPacket {
                        id,
                        created_at,
                        priority,
                        expires_at,
                        packet: DataPacket::new(attributes, content),
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        tx.commit()?;

        tracing::debug!(reservation_id, count = records.len(), "queue: claimed batch");
        Ok(Batch {
            queue: self,
            reservation_id: Some(reservation_id),
            records,
        })
    }

    fn resolve(&self, reservation_id: i64, delivered: bool) -> Result<usize> {
        let mut conn = self.db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = if delivered {
            tx.execute(
                "DELETE FROM queued_packets WHERE reservation_id = ?1",
                params![reservation_id],
            )?
        } else {
            tx.execute(
                "UPDATE queued_packets SET reservation_id = NULL WHERE reservation_id = ?1",
                params![reservation_id],
            )?
        };
        tx.execute("DELETE FROM reservations WHERE id = ?1", params![reservation_id])?;
        tx.commit()?;
        Ok(rows)
    }

    /// Enforce TTL, row-count and size bounds in one write transaction.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        let now = Self::now_ms();
        let mut stats = CleanupStats::default();

        let mut conn = self.db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        stats.expired = tx.execute(
            "DELETE FROM queued_packets WHERE expires_at <= ?1",
            params![now],
        )?;

        if self.config.max_rows > 0 {
            let rows: i64 = tx.query_row("SELECT COUNT(*) FROM queued_packets", [], |r| r.get(0))?;
            let surplus = rows - self.config.max_rows;
            if surplus > 0 {
                stats.over_row_limit = tx.execute(
                    "DELETE FROM queued_packets WHERE id IN (
                         SELECT id FROM queued_packets
                         ORDER BY priority ASC, created_at ASC, id ASC
                         LIMIT ?1
                     )",
                    params![surplus],
                )?;
            }
        }

        if self.config.max_size > 0 {
            loop {
                let total = stored_bytes(&tx)?;
                let mut excess = total - self.config.max_size;
                if excess <= 0 {
                    break;
                }

                let candidates: Vec<(i64, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, LENGTH(attributes) + LENGTH(content) FROM queued_packets
                         ORDER BY priority ASC, created_at ASC, id ASC
                         LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![CLEANUP_CHUNK as i64], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                if candidates.is_empty() {
                    break;
                }

                let mut doomed = Vec::new();
                for (id, size) in candidates {
                    if excess <= 0 {
                        break;
                    }
                    doomed.push(id);
                    excess -= size;
                }

                let mut stmt = tx.prepare("DELETE FROM queued_packets WHERE id = ?1")?;
                for id in &doomed {
                    stmt.execute(params![id])?;
                }
                stats.over_size_limit += doomed.len();
            }
        }

        tx.commit()?;

        if stats.total() > 0 {
            tracing::info!(
                expired = stats.expired,
                over_rows = stats.over_row_limit,
                over_size = stats.over_size_limit,
                "queue: cleanup removed packets"
            );
        }
        Ok(stats)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db()?;
        let (rows, reserved_rows): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(reservation_id) FROM queued_packets",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let reservations: i64 =
            conn.query_row("SELECT COUNT(*) FROM reservations", [], |r| r.get(0))?;
        let bytes = stored_bytes(&conn)?;
        Ok(QueueStats {
            rows: rows as u64,
            reserved_rows: reserved_rows as u64,
            reservations: reservations as u64,
            stored_bytes: bytes as u64,
        })
    }
}

fn release_expired(conn: &Connection, now: i64) -> Result<usize> {
    let released = conn.execute(
        "UPDATE queued_packets SET reservation_id = NULL
         WHERE reservation_id IN (SELECT id FROM reservations WHERE expires_at <= ?1)",
        params![now],
    )?;
    let markers = conn.execute("DELETE FROM reservations WHERE expires_at <= ?1", params![now])?;
    if markers > 0 {
        tracing::warn!(markers, released, "queue: released abandoned reservations");
    }
    Ok(released)
}

fn stored_bytes(conn: &Connection) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(attributes) + LENGTH(content)), 0) FROM queued_packets",
        [],
        |r| r.get(0),
    )?;
    Ok(total)
}

/// A claimed batch. Resolve it with exactly one of `transaction_complete`
/// or `transaction_failed`; an unresolved batch stays reserved until its
/// reservation expires.
pub struct Batch<'a> {
    queue: &'a SqliteQueue,
    reservation_id: Option<i64>,
    records: Vec<QueuedPacket>,
}

impl<'a> Batch<'a> {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn reservation_id(&self) -> Option<i64> {
        self.reservation_id
    }

    pub fn records(&self) -> &[QueuedPacket] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataPacket> {
        self.records.iter().map(|r| &r.packet)
    }

    /// Delivery confirmed: delete the batch rows and the reservation.
    pub fn transaction_complete(mut self) -> Result<usize> {
        match self.reservation_id.take() {
            Some(id) => {
                let deleted = self.queue.resolve(id, true)?;
                tracing::debug!(reservation_id = id, deleted, "queue: batch complete");
                Ok(deleted)
            }
            None => Ok(0),
        }
    }

    /// Delivery failed: return the rows to the pool and drop the reservation.
    pub fn transaction_failed(mut self) -> Result<usize> {
        match self.reservation_id.take() {
            Some(id) => {
                let released = self.queue.resolve(id, false)?;
                tracing::warn!(reservation_id = id, released, "queue: batch released after failure");
                Ok(released)
            }
            None => Ok(0),
        }
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.reservation_id {
            tracing::warn!(
                reservation_id = id,
                count = self.records.len(),
                "queue: batch dropped unresolved; rows stay reserved until expiry"
            );
        }
    }
}
