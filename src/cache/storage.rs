//! SQLite implementation of cache storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::CacheStorage;
use crate::error::{Result, WorkerError};
use crate::http::{RequestIdentity, ResponseSnapshot};

/// SQLite-based cache storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) cache storage at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| cache_err("Failed to create cache directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      WorkerError::CacheStorage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| cache_err("Failed to open in-memory cache database", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| cache_err("Failed to run cache migrations", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::CacheStorage(format!("Lock poisoned: {}", e)))
  }

  /// Number of entries in a generation.
  pub fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| cache_err("Failed to count cache entries", e))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }
}

/// Schema for cache generations and their entries.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One snapshot per request identity per generation
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    UNIQUE (generation, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(request_hash);
"#;

fn cache_err(context: &str, e: impl std::fmt::Display) -> WorkerError {
  WorkerError::CacheStorage(format!("{}: {}", context, e))
}

fn ensure_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| cache_err("Failed to open cache generation", e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  identity: &RequestIdentity,
  snapshot: &ResponseSnapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&snapshot.headers)
    .map_err(|e| cache_err("Failed to serialize headers", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        generation,
        identity.cache_hash(),
        identity.method,
        identity.url,
        snapshot.status,
        headers,
        snapshot.body,
        snapshot.cached_at.to_rfc3339(),
      ],
    )
    .map_err(|e| cache_err("Failed to store cache entry", e))?;
  Ok(())
}

type SnapshotRow = (u16, String, Vec<u8>, String);

fn snapshot_from_row((status, headers, body, cached_at): SnapshotRow) -> Result<ResponseSnapshot> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| cache_err("Failed to deserialize headers", e))?;
  let cached_at = DateTime::parse_from_rfc3339(&cached_at)
    .map_err(|e| cache_err(&format!("Failed to parse cached_at '{}'", cached_at), e))?
    .with_timezone(&Utc);

  Ok(ResponseSnapshot {
    status,
    headers,
    body,
    cached_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_generation(&conn, generation)
  }

  fn has(&self, generation: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| cache_err("Failed to look up cache generation", e))?;
    Ok(found.is_some())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY seq")
      .map_err(|e| cache_err("Failed to prepare query", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| cache_err("Failed to list cache generations", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| cache_err("Failed to read cache generation", e))?;
    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| cache_err("Failed to begin transaction", e))?;

    // Entries first, then the generation row itself
    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| cache_err("Failed to delete cache entries", e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| cache_err("Failed to delete cache generation", e))?;

    tx.commit()
      .map_err(|e| cache_err("Failed to commit transaction", e))?;
    Ok(removed > 0)
  }

  fn match_in(
    &self,
    generation: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;
    let row: Option<SnapshotRow> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND request_hash = ?",
        params![generation, identity.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| cache_err("Failed to match cache entry", e))?;

    row.map(snapshot_from_row).transpose()
  }

  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;
    let row: Option<SnapshotRow> = conn
      .query_row(
        // Oldest generation wins when several hold the same request
        "SELECT e.status, e.headers, e.body, e.cached_at FROM cache_entries e
         INNER JOIN cache_generations g ON g.name = e.generation
         WHERE e.request_hash = ?
         ORDER BY g.seq
         LIMIT 1",
        params![identity.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| cache_err("Failed to match cache entry", e))?;

    row.map(snapshot_from_row).transpose()
  }

  fn put(
    &self,
    generation: &str,
    identity: &RequestIdentity,
    snapshot: &ResponseSnapshot,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| cache_err("Failed to begin transaction", e))?;
    ensure_generation(&tx, generation)?;
    insert_entry(&tx, generation, identity, snapshot)?;
    tx.commit()
      .map_err(|e| cache_err("Failed to commit transaction", e))
  }

  fn put_all(
    &self,
    generation: &str,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| cache_err("Failed to begin transaction", e))?;
    ensure_generation(&tx, generation)?;
    // Any failed insert drops the transaction and nothing is written
    for (identity, snapshot) in entries {
      insert_entry(&tx, generation, identity, snapshot)?;
    }
    tx.commit()
      .map_err(|e| cache_err("Failed to commit transaction", e))
  }

  fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE generation = ? ORDER BY seq")
      .map_err(|e| cache_err("Failed to prepare query", e))?;

    let keys = stmt
      .query_map(params![generation], |row| {
        Ok(RequestIdentity {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| cache_err("Failed to list cache entries", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| cache_err("Failed to read cache entry", e))?;
    Ok(keys)
  }
}
