//! Cache store scoped to the current generation's regions.

use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;

use super::region::{CacheRegion, CachedResponse, RegionKind};
use super::storage::CacheStorage;
use crate::net::{Request, ResponseSnapshot};

/// Why a response was not written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
  NotSuccess,
  NotGet,
  NotNetworkScheme,
}

/// The current generation's view of the cache storage.
///
/// Requests only ever read and write the current shell and runtime-data
/// regions; regions of other generations are reachable only for garbage
/// collection.
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
  shell: CacheRegion,
  data: CacheRegion,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn CacheStorage>, prefix: &str, generation: &str) -> Self {
    Self {
      storage,
      shell: CacheRegion::new(prefix, RegionKind::Shell, generation),
      data: CacheRegion::new(prefix, RegionKind::RuntimeData, generation),
    }
  }

  pub fn region(&self, kind: RegionKind) -> &CacheRegion {
    match kind {
      RegionKind::Shell => &self.shell,
      RegionKind::RuntimeData => &self.data,
    }
  }

  pub fn generation(&self) -> &str {
    &self.shell.generation
  }

  /// Create both regions of the current generation.
  pub fn open_regions(&self) -> Result<()> {
    self.storage.create_region(&self.shell)?;
    self.storage.create_region(&self.data)
  }

  /// Store a response in the current region of `kind`.
  ///
  /// Returns `Ok(Err(skip))` when the pair is not cacheable.
  pub fn put(
    &self,
    kind: RegionKind,
    request: &Request,
    response: &ResponseSnapshot,
  ) -> Result<std::result::Result<(), Skip>> {
    if let Some(skip) = Self::check_cacheable(request, response) {
      return Ok(Err(skip));
    }
    self.storage.put(self.region(kind), request, response)?;
    Ok(Ok(()))
  }

  /// Look up a request in the current region of `kind`.
  pub fn lookup(&self, kind: RegionKind, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::GET || !request.has_network_scheme() {
      return Ok(None);
    }
    self.storage.get(self.region(kind), request)
  }

  /// Regions that don't belong to the current generation.
  pub fn stale_regions(&self) -> Result<Vec<CacheRegion>> {
    Ok(
      self
        .storage
        .list_regions()?
        .into_iter()
        .filter(|r| r.name != self.shell.name && r.name != self.data.name)
        .collect(),
    )
  }

  pub fn regions(&self) -> Result<Vec<CacheRegion>> {
    self.storage.list_regions()
  }

  pub fn delete_region(&self, name: &str) -> Result<bool> {
    self.storage.delete_region(name)
  }

  pub fn entry_count(&self, name: &str) -> Result<usize> {
    self.storage.entry_count(name)
  }

  fn check_cacheable(request: &Request, response: &ResponseSnapshot) -> Option<Skip> {
    if !request.has_network_scheme() {
      Some(Skip::NotNetworkScheme)
    } else if request.method != Method::GET {
      Some(Skip::NotGet)
    } else if !response.is_success() {
      Some(Skip::NotSuccess)
    } else {
      None
    }
  }
}
