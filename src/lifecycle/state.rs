//! Generation lifecycle states and their persisted registry.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
  /// Superseded by a newer generation
  Redundant,
}

impl LifecycleState {
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }

  pub fn from_str_checked(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(Self::Installing),
      "installed" => Some(Self::Installed),
      "activating" => Some(Self::Activating),
      "active" => Some(Self::Active),
      "redundant" => Some(Self::Redundant),
      _ => None,
    }
  }

  /// Allowed moves. Any state may become redundant; redundant is terminal.
  pub fn can_transition_to(&self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Installing, Installed)
        | (Installed, Activating)
        | (Activating, Active)
        | (Installing | Installed | Activating | Active, Redundant)
    )
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Persisted state of every generation seen by this database.
pub struct GenerationRegistry {
  db: Arc<Database>,
}

impl GenerationRegistry {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn state(&self, tag: &str) -> Result<Option<LifecycleState>> {
    let conn = self.db.conn()?;
    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM generations WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load generation {}: {}", tag, e))?;

    state
      .map(|s| {
        LifecycleState::from_str_checked(&s)
          .ok_or_else(|| eyre!("Unknown state '{}' for generation {}", s, tag))
      })
      .transpose()
  }

  /// Record a new state for `tag`, stamping install/activation times.
  pub fn record(&self, tag: &str, state: LifecycleState) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO generations (tag, state) VALUES (?1, ?2)
         ON CONFLICT(tag) DO UPDATE SET state = excluded.state",
        params![tag, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to record generation {}: {}", tag, e))?;

    let stamp = match state {
      LifecycleState::Installed => Some("installed_at"),
      LifecycleState::Active => Some("activated_at"),
      _ => None,
    };
    if let Some(column) = stamp {
      conn
        .execute(
          &format!("UPDATE generations SET {} = ?1 WHERE tag = ?2", column),
          params![now, tag],
        )
        .map_err(|e| eyre!("Failed to stamp generation {}: {}", tag, e))?;
    }
    Ok(())
  }

  /// Mark every other generation redundant. Returns the tags that changed.
  pub fn retire_others(&self, current: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM generations WHERE tag != ? AND state != 'redundant' ORDER BY tag")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let tags: Vec<String> = stmt
      .query_map(params![current], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generation: {}", e))?;

    conn
      .execute(
        "UPDATE generations SET state = 'redundant' WHERE tag != ? AND state != 'redundant'",
        params![current],
      )
      .map_err(|e| eyre!("Failed to retire old generations: {}", e))?;

    Ok(tags)
  }
}
