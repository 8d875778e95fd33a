//! Durable local database for background-synced records.
//!
//! A versioned record store: each object store holds JSON records keyed by a
//! field of the record (its key path). Opening with a higher version than the
//! one on disk runs an upgrade callback inside a transaction, which is where
//! object stores get created.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, WorkerError};

fn db_err(context: &str, e: impl std::fmt::Display) -> WorkerError {
  WorkerError::Database(format!("{}: {}", context, e))
}

/// Handle passed to the upgrade callback while the version change is in progress.
pub struct Upgrade<'a> {
  conn: &'a Connection,
  old_version: u32,
  new_version: u32,
}

impl Upgrade<'_> {
  /// Version on disk before the upgrade; 0 for a newly created database.
  pub fn old_version(&self) -> u32 {
    self.old_version
  }

  pub fn new_version(&self) -> u32 {
    self.new_version
  }

  pub fn contains_store(&self, name: &str) -> Result<bool> {
    store_exists(self.conn, name)
  }

  pub fn create_object_store(&self, name: &str, key_path: &str) -> Result<()> {
    if self.contains_store(name)? {
      return Err(WorkerError::Database(format!(
        "Object store '{}' already exists",
        name
      )));
    }
    self
      .conn
      .execute(
        "INSERT INTO object_stores (name, key_path) VALUES (?, ?)",
        params![name, key_path],
      )
      .map_err(|e| db_err("Failed to create object store", e))?;
    Ok(())
  }
}

fn store_exists(conn: &Connection, name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM object_stores WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| db_err("Failed to look up object store", e))?;
  Ok(found.is_some())
}

/// Versioned local record database
pub struct Database {
  conn: Connection,
  version: u32,
}

impl Database {
  /// Open or create the database at `path`, upgrading to `version` if needed.
  pub fn open<F>(path: &Path, version: u32, upgrade: F) -> Result<Self>
  where
    F: FnOnce(&Upgrade<'_>) -> Result<()>,
  {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| db_err("Failed to create database directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      WorkerError::Database(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn, version, upgrade)
  }

  pub fn open_in_memory<F>(version: u32, upgrade: F) -> Result<Self>
  where
    F: FnOnce(&Upgrade<'_>) -> Result<()>,
  {
    let conn = Connection::open_in_memory()
      .map_err(|e| db_err("Failed to open in-memory database", e))?;
    Self::from_connection(conn, version, upgrade)
  }

  /// Database file for a named database inside the data directory.
  pub fn path_in(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{}.db", name))
  }

  fn from_connection<F>(mut conn: Connection, version: u32, upgrade: F) -> Result<Self>
  where
    F: FnOnce(&Upgrade<'_>) -> Result<()>,
  {
    if version == 0 {
      return Err(WorkerError::Database(
        "Database version must be at least 1".to_string(),
      ));
    }

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| db_err("Failed to run migrations", e))?;

    let current: u32 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| db_err("Failed to read database version", e))?;

    if current > version {
      return Err(WorkerError::Database(format!(
        "Requested version {} is lower than existing version {}",
        version, current
      )));
    }

    if current < version {
      let tx = conn
        .transaction()
        .map_err(|e| db_err("Failed to begin upgrade", e))?;
      upgrade(&Upgrade {
        conn: &tx,
        old_version: current,
        new_version: version,
      })?;
      tx.execute_batch(&format!("PRAGMA user_version = {}", version))
        .map_err(|e| db_err("Failed to set database version", e))?;
      tx.commit()
        .map_err(|e| db_err("Failed to commit upgrade", e))?;
      info!(from = current, to = version, "local database upgraded");
    }

    Ok(Self { conn, version })
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn object_store_names(&self) -> Result<Vec<String>> {
    let mut stmt = self
      .conn
      .prepare("SELECT name FROM object_stores ORDER BY name")
      .map_err(|e| db_err("Failed to prepare query", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| db_err("Failed to list object stores", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| db_err("Failed to read object store", e))?;
    Ok(names)
  }

  fn key_path(&self, store: &str) -> Result<String> {
    self
      .conn
      .query_row(
        "SELECT key_path FROM object_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| db_err("Failed to look up object store", e))?
      .ok_or_else(|| WorkerError::Database(format!("Object store '{}' not found", store)))
  }

  /// Upsert records into a store inside one transaction.
  ///
  /// A record replaces any existing record with the same key.
  pub fn put_all(&mut self, store: &str, records: &[Value]) -> Result<usize> {
    let key_path = self.key_path(store)?;
    let tx = self
      .conn
      .transaction()
      .map_err(|e| db_err("Failed to begin transaction", e))?;

    for record in records {
      let key = record_key(record, &key_path)?;
      let value = serde_json::to_string(record).map_err(|e| db_err("Failed to encode record", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO records (store, key, value, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![store, key, value],
      )
      .map_err(|e| db_err("Failed to store record", e))?;
    }

    tx.commit()
      .map_err(|e| db_err("Failed to commit transaction", e))?;
    Ok(records.len())
  }

  pub fn put(&mut self, store: &str, record: &Value) -> Result<()> {
    self.put_all(store, std::slice::from_ref(record)).map(|_| ())
  }

  pub fn get(&self, store: &str, key: &Value) -> Result<Option<Value>> {
    let key = encode_key(key)?;
    let value: Option<String> = self
      .conn
      .query_row(
        "SELECT value FROM records WHERE store = ? AND key = ?",
        params![store, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| db_err("Failed to read record", e))?;

    value
      .map(|v| serde_json::from_str(&v).map_err(|e| db_err("Failed to decode record", e)))
      .transpose()
  }

  pub fn get_all(&self, store: &str) -> Result<Vec<Value>> {
    let mut stmt = self
      .conn
      .prepare("SELECT value FROM records WHERE store = ? ORDER BY key")
      .map_err(|e| db_err("Failed to prepare query", e))?;
    let rows = stmt
      .query_map(params![store], |row| row.get::<_, String>(0))
      .map_err(|e| db_err("Failed to query records", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| db_err("Failed to read record", e))?;

    rows
      .iter()
      .map(|v| serde_json::from_str(v).map_err(|e| db_err("Failed to decode record", e)))
      .collect()
  }

  pub fn count(&self, store: &str) -> Result<usize> {
    let count: i64 = self
      .conn
      .query_row(
        "SELECT COUNT(*) FROM records WHERE store = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| db_err("Failed to count records", e))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }
}

/// Extract and encode the key of a record. Only strings and numbers are valid keys.
fn record_key(record: &Value, key_path: &str) -> Result<String> {
  let key = record.get(key_path).ok_or_else(|| {
    WorkerError::Database(format!("Record has no '{}' field", key_path))
  })?;
  encode_key(key)
}

fn encode_key(key: &Value) -> Result<String> {
  match key {
    Value::String(_) => serde_json::to_string(key).map_err(|e| db_err("Failed to encode key", e)),
    Value::Number(n) => Ok(encode_number(n)),
    other => Err(WorkerError::Database(format!(
      "Invalid record key: {}",
      other
    ))),
  }
}

/// Numeric keys compare by value: `1` and `1.0` name the same record.
fn encode_number(n: &serde_json::Number) -> String {
  if let Some(i) = n.as_i64() {
    return i.to_string();
  }
  if let Some(u) = n.as_u64() {
    return u.to_string();
  }
  match n.as_f64() {
    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
      (f as i64).to_string()
    }
    Some(f) => f.to_string(),
    None => n.to_string(),
  }
}
