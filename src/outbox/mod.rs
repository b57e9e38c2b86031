//! Durable outbox of sales that could not reach the server.
//!
//! Records are appended with `synced = false` and only ever change by having
//! `synced`/`synced_at` set once the server acknowledges a replay. Nothing is
//! deleted except by the optional retention pruning of synced records.

mod drain;

pub use drain::{DrainReport, Drainer};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::parse_datetime;
use crate::db::Database;

/// One queued sale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRecord {
  /// Auto-assigned, strictly increasing
  pub id: i64,
  /// Sale body as submitted by the client
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub synced_at: Option<DateTime<Utc>>,
}

/// Record counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
  pub pending: usize,
  pub synced: usize,
}

/// SQLite-backed outbox.
pub struct Outbox {
  db: Arc<Database>,
}

const RECORD_COLUMNS: &str = "id, payload, created_at, synced, synced_at";

impl Outbox {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a new pending record. The record is durable once this returns.
  pub fn enqueue(&self, payload: &Value) -> Result<OutboxRecord> {
    let created_at = Utc::now();
    let conn = self.db.conn()?;

    conn
      .execute(
        "INSERT INTO outbox (payload, created_at, synced) VALUES (?, ?, 0)",
        params![payload.to_string(), created_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue sale: {}", e))?;

    Ok(OutboxRecord {
      id: conn.last_insert_rowid(),
      payload: payload.clone(),
      created_at,
      synced: false,
      synced_at: None,
    })
  }

  #[cfg(test)]
  pub fn get(&self, id: i64) -> Result<Option<OutboxRecord>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        &format!("SELECT {} FROM outbox WHERE id = ?", RECORD_COLUMNS),
        params![id],
        RawRecord::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load outbox record {}: {}", id, e))?;

    row.map(RawRecord::into_record).transpose()
  }

  /// Records not yet acknowledged, oldest first.
  pub fn pending(&self) -> Result<Vec<OutboxRecord>> {
    self.select(&format!(
      "SELECT {} FROM outbox WHERE synced = 0 ORDER BY id",
      RECORD_COLUMNS
    ))
  }

  /// Every record, oldest first.
  #[cfg(test)]
  pub fn records(&self) -> Result<Vec<OutboxRecord>> {
    self.select(&format!("SELECT {} FROM outbox ORDER BY id", RECORD_COLUMNS))
  }

  /// Flip a pending record to synced.
  ///
  /// Returns false when the record was already synced (or doesn't exist), so
  /// a record is acknowledged at most once.
  pub fn mark_synced(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE outbox SET synced = 1, synced_at = ? WHERE id = ? AND synced = 0",
        params![Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to mark outbox record {} synced: {}", id, e))?;
    Ok(changed > 0)
  }

  pub fn counts(&self) -> Result<OutboxCounts> {
    let conn = self.db.conn()?;
    let (pending, synced): (i64, i64) = conn
      .query_row(
        "SELECT
           COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0)
         FROM outbox",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to count outbox records: {}", e))?;

    Ok(OutboxCounts {
      pending: pending as usize,
      synced: synced as usize,
    })
  }

  /// Delete synced records acknowledged more than `older_than` ago.
  /// Pending records are never touched.
  pub fn prune_synced(&self, older_than: chrono::Duration) -> Result<usize> {
    let cutoff = Utc::now() - older_than;
    let conn = self.db.conn()?;
    // RFC 3339 timestamps in UTC compare correctly as text.
    let deleted = conn
      .execute(
        "DELETE FROM outbox WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at < ?",
        params![cutoff.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to prune outbox: {}", e))?;
    Ok(deleted)
  }

  fn select(&self, sql: &str) -> Result<Vec<OutboxRecord>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<RawRecord> = stmt
      .query_map([], RawRecord::from_row)
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read outbox record: {}", e))?;

    rows.into_iter().map(RawRecord::into_record).collect()
  }
}

/// Row as stored, before JSON and timestamp parsing
struct RawRecord {
  id: i64,
  payload: String,
  created_at: String,
  synced: bool,
  synced_at: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      payload: row.get(1)?,
      created_at: row.get(2)?,
      synced: row.get(3)?,
      synced_at: row.get(4)?,
    })
  }

  fn into_record(self) -> Result<OutboxRecord> {
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Corrupt payload in outbox record {}: {}", self.id, e))?;

    Ok(OutboxRecord {
      id: self.id,
      payload,
      created_at: parse_datetime(&self.created_at)?,
      synced: self.synced,
      synced_at: self.synced_at.as_deref().map(parse_datetime).transpose()?,
    })
  }
}
