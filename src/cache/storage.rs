//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::region::{CacheRegion, CachedResponse, RegionKind};
use crate::db::Database;
use crate::net::{Request, ResponseSnapshot};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create a region if it doesn't exist yet.
  fn create_region(&self, region: &CacheRegion) -> Result<()>;

  /// All regions, in creation order.
  fn list_regions(&self) -> Result<Vec<CacheRegion>>;

  /// Delete a region and every entry in it. Returns false if it didn't exist.
  fn delete_region(&self, name: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the same key.
  fn put(&self, region: &CacheRegion, request: &Request, response: &ResponseSnapshot)
    -> Result<()>;

  /// Look up the entry for a request.
  fn get(&self, region: &CacheRegion, request: &Request) -> Result<Option<CachedResponse>>;

  /// Number of entries in a region.
  fn entry_count(&self, name: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn create_region(&self, _region: &CacheRegion) -> Result<()> {
    Ok(())
  }

  fn list_regions(&self) -> Result<Vec<CacheRegion>> {
    Ok(Vec::new())
  }

  fn delete_region(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn put(
    &self,
    _region: &CacheRegion,
    _request: &Request,
    _response: &ResponseSnapshot,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _region: &CacheRegion, _request: &Request) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn entry_count(&self, _name: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn create_region(&self, region: &CacheRegion) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_regions (name, kind, generation, created_at)
         VALUES (?, ?, ?, ?)",
        params![
          region.name,
          region.kind.as_str(),
          region.generation,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to create cache region {}: {}", region.name, e))?;
    Ok(())
  }

  fn list_regions(&self) -> Result<Vec<CacheRegion>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name, kind, generation FROM cache_regions ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list cache regions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache region: {}", e))?;

    rows
      .into_iter()
      .map(|(name, kind, generation)| {
        let kind = RegionKind::from_str_checked(&kind)
          .ok_or_else(|| eyre!("Unknown kind '{}' for cache region {}", kind, name))?;
        Ok(CacheRegion {
          name,
          kind,
          generation,
        })
      })
      .collect()
  }

  fn delete_region(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE region = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of region {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM cache_regions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete region {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn put(
    &self,
    region: &CacheRegion,
    request: &Request,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let now = Utc::now().to_rfc3339();

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_regions (name, kind, generation, created_at)
       VALUES (?, ?, ?, ?)",
      params![region.name, region.kind.as_str(), region.generation, now],
    )
    .map_err(|e| eyre!("Failed to create cache region {}: {}", region.name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (region, key_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        region.name,
        request.key_hash(),
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        headers,
        response.body,
        now
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request.cache_key(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, region: &CacheRegion, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE region = ? AND key_hash = ?",
        params![region.name, request.key_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.cache_key(), e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: ResponseSnapshot {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE region = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of region {}: {}", name, e))?;
    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Backend whose every operation fails, as a full or corrupt disk would.
#[cfg(test)]
pub(crate) struct FailingStorage;

#[cfg(test)]
impl CacheStorage for FailingStorage {
  fn create_region(&self, region: &CacheRegion) -> Result<()> {
    Err(eyre!("Failed to create cache region {}: disk I/O error", region.name))
  }

  fn list_regions(&self) -> Result<Vec<CacheRegion>> {
    Err(eyre!("Failed to list cache regions: disk I/O error"))
  }

  fn delete_region(&self, name: &str) -> Result<bool> {
    Err(eyre!("Failed to delete cache region {}: disk I/O error", name))
  }

  fn put(&self, region: &CacheRegion, _request: &Request, _response: &ResponseSnapshot) -> Result<()> {
    Err(eyre!("Failed to write to {}: disk I/O error", region.name))
  }

  fn get(&self, region: &CacheRegion, _request: &Request) -> Result<Option<CachedResponse>> {
    Err(eyre!("Failed to read from {}: disk I/O error", region.name))
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    Err(eyre!("Failed to count entries of {}: disk I/O error", name))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn products() -> Request {
    Request::get(Url::parse("http://pos.local/api/v1/productos/").unwrap())
  }

  #[test]
  fn test_put_then_get_returns_latest() {
    let storage = storage();
    let region = CacheRegion::new("cantina", RegionKind::RuntimeData, "v1");

    storage
      .put(&region, &products(), &ResponseSnapshot::new(200, "old"))
      .unwrap();
    storage
      .put(&region, &products(), &ResponseSnapshot::new(200, "new"))
      .unwrap();

    let cached = storage.get(&region, &products()).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
    assert_eq!(storage.entry_count(&region.name).unwrap(), 1);
  }

  #[test]
  fn test_headers_survive_storage() {
    let storage = storage();
    let region = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    let response = ResponseSnapshot::json(200, &serde_json::json!({"ok": true}));

    storage.put(&region, &products(), &response).unwrap();

    let cached = storage.get(&region, &products()).unwrap().unwrap();
    assert_eq!(cached.response, response);
  }

  #[test]
  fn test_regions_are_isolated() {
    let storage = storage();
    let shell = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    let data = CacheRegion::new("cantina", RegionKind::RuntimeData, "v1");

    storage
      .put(&data, &products(), &ResponseSnapshot::new(200, "x"))
      .unwrap();

    assert!(storage.get(&shell, &products()).unwrap().is_none());
    assert!(storage.get(&data, &products()).unwrap().is_some());
  }

  #[test]
  fn test_delete_region_removes_entries() {
    let storage = storage();
    let region = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    storage
      .put(&region, &products(), &ResponseSnapshot::new(200, "x"))
      .unwrap();

    assert!(storage.delete_region(&region.name).unwrap());
    assert!(!storage.delete_region(&region.name).unwrap());
    assert!(storage.get(&region, &products()).unwrap().is_none());
    assert!(storage.list_regions().unwrap().is_empty());
  }

  #[test]
  fn test_create_region_is_idempotent() {
    let storage = storage();
    let region = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    storage.create_region(&region).unwrap();
    storage.create_region(&region).unwrap();
    assert_eq!(storage.list_regions().unwrap(), vec![region]);
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let region = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    NoopStorage
      .put(&region, &products(), &ResponseSnapshot::new(200, "x"))
      .unwrap();
    assert!(NoopStorage.get(&region, &products()).unwrap().is_none());
  }
}
