//! Durable mirror of the offline queue: trait and implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use url::Url;

use super::operation::OfflineOperation;
use crate::error::{Error, Result};
use crate::http::Headers;

/// Trait for queue storage backends.
///
/// `save_queue` always overwrites the whole stored queue, so it is
/// idempotent and a failed write never leaves a half-patched queue behind.
#[async_trait]
pub trait QueueStore: Send + Sync {
  /// Load every stored operation, ordered by sequence id.
  async fn load_queue(&self) -> Result<Vec<OfflineOperation>>;

  /// Replace the stored queue with `operations`.
  async fn save_queue(&self, operations: &[OfflineOperation]) -> Result<()>;
}

/// Storage that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
  operations: Mutex<Vec<OfflineOperation>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// What is currently stored.
  pub fn snapshot(&self) -> Vec<OfflineOperation> {
    self
      .operations
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
  async fn load_queue(&self) -> Result<Vec<OfflineOperation>> {
    Ok(self.snapshot())
  }

  async fn save_queue(&self, operations: &[OfflineOperation]) -> Result<()> {
    let mut stored = self
      .operations
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    *stored = operations.to_vec();
    Ok(())
  }
}

/// SQLite-based queue storage.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_queue (
    sequence INTEGER PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL
);
"#;

impl SqliteQueueStore {
  /// Open (or create) the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run queue migrations: {}", e)))?;

    Ok(())
  }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
  async fn load_queue(&self) -> Result<Vec<OfflineOperation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;

    let mut stmt = conn.prepare(
      "SELECT sequence, method, url, headers, body, enqueued_at FROM offline_queue
       ORDER BY sequence",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok(StoredRow {
          sequence: row.get(0)?,
          method: row.get(1)?,
          url: row.get(2)?,
          headers: row.get(3)?,
          body: row.get(4)?,
          enqueued_at: row.get(5)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(StoredRow::into_operation).collect()
  }

  async fn save_queue(&self, operations: &[OfflineOperation]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;

    // Full rewrite in one transaction
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM offline_queue", [])?;
    {
      let mut insert = tx.prepare(
        "INSERT INTO offline_queue (sequence, method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
      )?;
      for op in operations {
        let headers = serde_json::to_string(&op.headers)?;
        insert.execute(params![
          op.sequence as i64,
          op.method.as_str(),
          op.url.as_str(),
          headers,
          op.body,
          op.enqueued_at.to_rfc3339(),
        ])?;
      }
    }
    tx.commit()?;

    debug!(count = operations.len(), "Persisted offline queue");
    Ok(())
  }
}

struct StoredRow {
  sequence: i64,
  method: String,
  url: String,
  headers: String,
  body: Option<Vec<u8>>,
  enqueued_at: String,
}

impl StoredRow {
  fn into_operation(self) -> Result<OfflineOperation> {
    let url = Url::parse(&self.url)
      .map_err(|e| Error::Storage(format!("Invalid stored url '{}': {}", self.url, e)))?;
    let headers: Headers = serde_json::from_str(&self.headers)?;
    let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| {
        Error::Storage(format!(
          "Failed to parse datetime '{}': {}",
          self.enqueued_at, e
        ))
      })?;

    Ok(OfflineOperation {
      sequence: self.sequence as u64,
      method: self
        .method
        .parse()
        .map_err(|e| Error::Storage(format!("Invalid stored method: {}", e)))?,
      url,
      headers,
      body: self.body,
      enqueued_at,
    })
  }
}
