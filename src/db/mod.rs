pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// File name of the database inside the data directory
pub const DB_FILE: &str = "posw.db";

/// Database connection shared by the cache store, the outbox and the lifecycle controller.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database inside `data_dir`
  pub fn open(data_dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(data_dir)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;

    let path = data_dir.join(DB_FILE);
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    // A committed outbox insert must survive a crash.
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
      .and_then(|_| conn.pragma_update(None, "synchronous", "FULL"))
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();

    let tables: i64 = db
      .conn()
      .unwrap()
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
         AND name IN ('cache_regions', 'cache_entries', 'outbox', 'generations')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 4);
  }

  #[test]
  fn test_open_creates_file_in_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("nested");
    Database::open(&nested).unwrap();
    assert!(nested.join(DB_FILE).exists());
  }
}
