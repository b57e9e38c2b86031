//! Cache regions and the values stored in them.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::net::ResponseSnapshot;

/// What a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
  /// Application shell, pre-populated on install
  Shell,
  /// API responses, populated as they are fetched
  RuntimeData,
}

impl RegionKind {
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Shell => "shell",
      Self::RuntimeData => "data",
    }
  }

  pub fn from_str_checked(s: &str) -> Option<Self> {
    match s {
      "shell" => Some(Self::Shell),
      "data" => Some(Self::RuntimeData),
      _ => None,
    }
  }
}

impl fmt::Display for RegionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A named, generation-tagged partition of cached responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRegion {
  pub name: String,
  pub kind: RegionKind,
  pub generation: String,
}

impl CacheRegion {
  /// Region of `kind` for `generation`, named `<prefix>-<kind>-<generation>`.
  pub fn new(prefix: &str, kind: RegionKind, generation: &str) -> Self {
    Self {
      name: format!("{}-{}-{}", prefix, kind, generation),
      kind,
      generation: generation.to_string(),
    }
  }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: ResponseSnapshot,
  /// When the entry was (last) written
  pub stored_at: DateTime<Utc>,
}
