//! Durable state: the admission gate for inbound items and the record of
//! objects this bot placed in cloud storage.
//!
//! Both tables live in one SQLite file. Every access goes through a single
//! connection behind a mutex, so a check-then-write sequence is atomic with
//! respect to every other caller in the process.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::util::{lock_mutex, now_ms};

/// `processing` records older than this are considered abandoned.
pub const STALE_AFTER_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Processing,
    Finished,
}

impl ProcessingStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Finished => "finished",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(Self::Processing),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    pub item_id: String,
    pub status: ProcessingStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedItemRecord {
    pub storage_id: String,
    pub display_name: String,
    pub uploaded_at_ms: i64,
}

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite db at {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory sqlite db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS processing (
  item_id TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  started_at_ms INTEGER NOT NULL,
  ended_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_processing_status ON processing(status, started_at_ms);

CREATE TABLE IF NOT EXISTS uploaded_items (
  storage_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  uploaded_at_ms INTEGER NOT NULL
);
            "#,
        )
        .context("failed to init sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a registry operation on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Registry) -> Result<T> + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .context("registry task failed")?
    }

    /// Claims exclusive processing rights over `item_id`.
    pub fn try_start(&self, item_id: &str) -> Result<bool> {
        self.try_start_at(item_id, now_ms())
    }

    pub fn try_start_at(&self, item_id: &str, now_ms: i64) -> Result<bool> {
        let mut conn = lock_mutex(&self.conn);
        sweep_stale(&conn, now_ms)?;

        let tx = conn.transaction()?;
        let running: Option<i64> = tx
            .query_row(
                "SELECT started_at_ms FROM processing WHERE item_id = ?1 AND status = 'processing'",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?;
        if running.is_some() {
            debug!("item {item_id} is already being processed");
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO processing (item_id, status, started_at_ms, ended_at_ms)
             VALUES (?1, 'processing', ?2, NULL)
             ON CONFLICT(item_id) DO UPDATE SET
               status = 'processing', started_at_ms = excluded.started_at_ms, ended_at_ms = NULL",
            params![item_id, now_ms],
        )?;
        tx.commit()?;
        debug!("item {item_id} admitted");
        Ok(true)
    }

    pub fn finish(&self, item_id: &str) -> Result<()> {
        let conn = lock_mutex(&self.conn);
        let updated = conn.execute(
            "UPDATE processing SET status = ?1, ended_at_ms = ?2 WHERE item_id = ?3",
            params![ProcessingStatus::Finished.as_str(), now_ms(), item_id],
        )?;
        if updated == 0 {
            warn!("no processing record for item {item_id} to finish");
        }
        Ok(())
    }

    /// Removes `processing` records older than [`STALE_AFTER_MS`].
    pub fn sweep_stale_at(&self, now_ms: i64) -> Result<usize> {
        let conn = lock_mutex(&self.conn);
        sweep_stale(&conn, now_ms)
    }

    pub fn processing_record(&self, item_id: &str) -> Result<Option<ProcessingRecord>> {
        let conn = lock_mutex(&self.conn);
        let row = conn
            .query_row(
                "SELECT item_id, status, started_at_ms, ended_at_ms FROM processing WHERE item_id = ?1",
                params![item_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((item_id, status, started_at_ms, ended_at_ms)) => {
                let status = ProcessingStatus::parse(&status)
                    .with_context(|| format!("unknown processing status {status:?}"))?;
                Ok(Some(ProcessingRecord {
                    item_id,
                    status,
                    started_at_ms,
                    ended_at_ms,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn record_uploaded(&self, storage_id: &str, display_name: &str) -> Result<()> {
        let conn = lock_mutex(&self.conn);
        conn.execute(
            "INSERT INTO uploaded_items (storage_id, display_name, uploaded_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(storage_id) DO UPDATE SET
               display_name = excluded.display_name, uploaded_at_ms = excluded.uploaded_at_ms",
            params![storage_id, display_name, now_ms()],
        )
        .with_context(|| format!("failed to record uploaded item {storage_id}"))?;
        info!("recorded uploaded item {storage_id} ({display_name})");
        Ok(())
    }

    /// All uploaded items in insertion order.
    pub fn uploaded_items(&self) -> Result<Vec<UploadedItemRecord>> {
        let conn = lock_mutex(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT storage_id, display_name, uploaded_at_ms FROM uploaded_items ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UploadedItemRecord {
                    storage_id: row.get(0)?,
                    display_name: row.get(1)?,
                    uploaded_at_ms: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn uploaded_item(&self, storage_id: &str) -> Result<Option<UploadedItemRecord>> {
        let conn = lock_mutex(&self.conn);
        let record = conn
            .query_row(
                "SELECT storage_id, display_name, uploaded_at_ms FROM uploaded_items WHERE storage_id = ?1",
                params![storage_id],
                |row| {
                    Ok(UploadedItemRecord {
                        storage_id: row.get(0)?,
                        display_name: row.get(1)?,
                        uploaded_at_ms: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Returns whether a record was removed.
    pub fn remove_uploaded(&self, storage_id: &str) -> Result<bool> {
        let conn = lock_mutex(&self.conn);
        let removed = conn.execute(
            "DELETE FROM uploaded_items WHERE storage_id = ?1",
            params![storage_id],
        )?;
        Ok(removed > 0)
    }

    pub fn clear_uploaded(&self) -> Result<usize> {
        let conn = lock_mutex(&self.conn);
        let removed = conn.execute("DELETE FROM uploaded_items", [])?;
        info!("cleared {removed} uploaded item records");
        Ok(removed)
    }
}

fn sweep_stale(conn: &Connection, now_ms: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM processing WHERE status = 'processing' AND started_at_ms < ?1",
        params![now_ms - STALE_AFTER_MS],
    )?;
    if removed > 0 {
        warn!("swept {removed} stale processing records");
    }
    Ok(removed)
}
