//! Per-request strategy execution.
//!
//! Every intercepted request gets an answer:
//! - sale submissions go to the network, and into the outbox when it is unreachable
//! - API data is fetched network-first with the runtime-data region as fallback
//! - everything else is served cache-first from the shell region and refreshed
//!   in the background
//!
//! Cache write failures are logged and never fail the request.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::cache::{CacheStore, RegionKind};
use crate::error::{FetchError, InterceptError};
use crate::event::{Signal, SignalSender};
use crate::net::{Network, Request, ResponseSnapshot};
use crate::outbox::Outbox;
use crate::router::{Classification, StrategyRouter};

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  /// Served from a cache region
  Cache,
  /// Sale accepted into the outbox
  Outbox,
  /// Offline error body, nothing else could answer
  Offline,
}

impl ResponseSource {
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Outbox => "outbox",
      Self::Offline => "offline",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Outcome {
  pub response: ResponseSnapshot,
  pub source: ResponseSource,
}

impl Outcome {
  fn new(response: ResponseSnapshot, source: ResponseSource) -> Self {
    Self { response, source }
  }

  fn offline() -> Self {
    Self::new(ResponseSnapshot::offline_error(), ResponseSource::Offline)
  }
}

pub struct Interceptor {
  router: StrategyRouter,
  cache: Arc<CacheStore>,
  outbox: Arc<Outbox>,
  network: Arc<dyn Network>,
  signals: SignalSender,
  refreshes: Mutex<JoinSet<()>>,
}

impl Interceptor {
  pub fn new(
    router: StrategyRouter,
    cache: Arc<CacheStore>,
    outbox: Arc<Outbox>,
    network: Arc<dyn Network>,
    signals: SignalSender,
  ) -> Self {
    Self {
      router,
      cache,
      outbox,
      network,
      signals,
      refreshes: Mutex::new(JoinSet::new()),
    }
  }

  /// Produce a response for an intercepted request.
  pub async fn handle(&self, request: Request) -> Result<Outcome, InterceptError> {
    if !request.has_network_scheme() {
      // Never cached: forward once and report the answer as-is.
      return Ok(Outcome::new(
        self.network.fetch(&request).await?,
        ResponseSource::Network,
      ));
    }

    let class = self.router.classify(&request.url);
    let span = tracing::debug_span!(
      "intercept",
      method = %request.method,
      url = %request.url,
      class = %class
    );

    async move {
      match class {
        Classification::SaleSubmit => self.submit_sale(request).await,
        Classification::ApiData => Ok(self.network_first(request).await),
        Classification::StaticAsset => Ok(self.cache_first(request).await),
      }
    }
    .instrument(span)
    .await
  }

  /// Network only; a sale that can't reach the server is queued in the outbox.
  async fn submit_sale(&self, request: Request) -> Result<Outcome, InterceptError> {
    let network_error = match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.signal(Signal::SaleAccepted);
        } else {
          // The server was reached and said no; never retried.
          debug!(status = response.status, "Sale rejected by server");
        }
        return Ok(Outcome::new(response, ResponseSource::Network));
      }
      Err(e) if !e.is_unreachable() => {
        // The server saw the sale; queueing it would replay it a second time.
        warn!("Sale reached the server but its answer was lost: {}", e);
        return Err(e.into());
      }
      Err(e) => e,
    };

    self.signal(Signal::Reachability(false));

    let payload: Value = match serde_json::from_slice(&request.body) {
      Ok(payload) => payload,
      Err(e) => {
        warn!("Sale body is not JSON, cannot queue it offline: {}", e);
        return Err(InterceptError::MalformedPayload {
          network: network_error,
          reason: e.to_string(),
        });
      }
    };

    let record = self.outbox.enqueue(&payload).map_err(|e| {
      error!("Failed to store sale offline: {}", e);
      InterceptError::OutboxWrite(e.to_string())
    })?;

    info!(id = record.id, "Sale stored offline: {}", network_error);
    Ok(Outcome::new(
      ResponseSnapshot::offline_accepted(),
      ResponseSource::Outbox,
    ))
  }

  /// Network first, falling back to the runtime-data region.
  async fn network_first(&self, request: Request) -> Outcome {
    match self.network.fetch(&request).await {
      Ok(response) => {
        self.store(RegionKind::RuntimeData, &request, &response);
        Outcome::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!("Network failed, trying cache: {}", e);
        self.report_unreachable(&e);
        match self.lookup(RegionKind::RuntimeData, &request) {
          Some(cached) => Outcome::new(cached, ResponseSource::Cache),
          None => Outcome::offline(),
        }
      }
    }
  }

  /// Shell region first; a hit is refreshed in the background.
  async fn cache_first(&self, request: Request) -> Outcome {
    if let Some(cached) = self.lookup(RegionKind::Shell, &request) {
      self.spawn_refresh(request);
      return Outcome::new(cached, ResponseSource::Cache);
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        self.store(RegionKind::Shell, &request, &response);
        Outcome::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!("Fetch failed: {}", e);
        self.report_unreachable(&e);
        Outcome::offline()
      }
    }
  }

  fn spawn_refresh(&self, request: Request) {
    let cache = Arc::clone(&self.cache);
    let network = Arc::clone(&self.network);

    let task = async move {
      match refresh(&*network, &cache, &request).await {
        Ok(()) => debug!("Refreshed {}", request.url),
        Err(e) => debug!("Background refresh failed: {}", e),
      }
    }
    .in_current_span();

    match self.refreshes.lock() {
      Ok(mut set) => {
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(e) => warn!("Skipping background refresh: {}", e),
    }
  }

  /// Wait for in-flight background refreshes.
  pub async fn wait_for_refreshes(&self) {
    let mut set = match self.refreshes.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while set.join_next().await.is_some() {}
  }

  fn lookup(&self, kind: RegionKind, request: &Request) -> Option<ResponseSnapshot> {
    match self.cache.lookup(kind, request) {
      Ok(Some(cached)) => {
        debug!(region = %kind, stored_at = %cached.stored_at, "Cache hit");
        Some(cached.response)
      }
      Ok(None) => None,
      Err(e) => {
        warn!("Cache lookup failed: {}", e);
        None
      }
    }
  }

  fn store(&self, kind: RegionKind, request: &Request, response: &ResponseSnapshot) {
    match self.cache.put(kind, request, response) {
      Ok(Ok(())) => {}
      Ok(Err(skip)) => debug!(?skip, status = response.status, "Not cached"),
      Err(e) => warn!("Cache write failed: {}", e),
    }
  }

  fn report_unreachable(&self, error: &FetchError) {
    if error.is_unreachable() {
      self.signal(Signal::Reachability(false));
    }
  }

  fn signal(&self, signal: Signal) {
    // The controller is gone only during shutdown.
    let _ = self.signals.send(signal);
  }
}

/// Fetch a fresh copy into the shell region. A failure leaves the old entry in place.
async fn refresh(
  network: &dyn Network,
  cache: &CacheStore,
  request: &Request,
) -> Result<(), String> {
  let response = network
    .fetch(request)
    .await
    .map_err(|e: FetchError| e.to_string())?;
  match cache.put(RegionKind::Shell, request, &response) {
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}
