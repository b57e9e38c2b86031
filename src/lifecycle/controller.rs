use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use super::state::{GenerationRegistry, LifecycleState};
use crate::cache::{CacheStore, RegionKind};
use crate::event::{Signal, SignalReceiver};
use crate::net::{Network, Request};
use crate::outbox::{DrainReport, Drainer};

/// Manifest entries fetched at once during install
const INSTALL_CONCURRENCY: usize = 4;

/// Snapshot published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub generation: String,
  pub state: LifecycleState,
  pub online: bool,
  pub last_drain: Option<DrainReport>,
  pub last_drain_at: Option<DateTime<Utc>>,
}

/// Result of pre-populating the shell region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: usize,
  pub failed: usize,
}

pub struct ControllerOptions {
  /// Critical assets pre-cached on install
  pub manifest: Vec<Url>,
  /// Prune synced outbox records older than this after each drain
  pub retention: Option<chrono::Duration>,
  /// Extra periodic drain trigger
  pub drain_interval: Option<Duration>,
}

/// Owns the generation lifecycle and decides when the outbox drains.
pub struct Controller {
  cache: Arc<CacheStore>,
  registry: GenerationRegistry,
  drainer: Arc<Drainer>,
  network: Arc<dyn Network>,
  options: ControllerOptions,
  status: watch::Sender<Status>,
}

impl Controller {
  pub fn new(
    cache: Arc<CacheStore>,
    registry: GenerationRegistry,
    drainer: Arc<Drainer>,
    network: Arc<dyn Network>,
    options: ControllerOptions,
  ) -> Self {
    let (status, _) = watch::channel(Status {
      generation: cache.generation().to_string(),
      state: LifecycleState::Installing,
      online: true,
      last_drain: None,
      last_drain_at: None,
    });

    Self {
      cache,
      registry,
      drainer,
      network,
      options,
      status,
    }
  }

  pub fn status(&self) -> Status {
    self.status.borrow().clone()
  }

  #[cfg(test)]
  pub fn subscribe(&self) -> watch::Receiver<Status> {
    self.status.subscribe()
  }

  /// Lifecycle state recorded for this generation, as left by the last run.
  pub fn stored_state(&self) -> Result<Option<LifecycleState>> {
    self.registry.state(self.cache.generation())
  }

  pub fn drainer(&self) -> &Arc<Drainer> {
    &self.drainer
  }

  /// Install then activate, as one step. With a single gateway process per
  /// database there is no older instance to wait for.
  pub async fn start(&self) -> Result<InstallReport> {
    let report = self.install().await?;
    self.activate()?;
    Ok(report)
  }

  /// Create this generation's regions and pre-cache the shell manifest.
  ///
  /// Assets that fail to cache are logged and skipped; they will be fetched
  /// on first use.
  pub async fn install(&self) -> Result<InstallReport> {
    self.enter(LifecycleState::Installing)?;
    self.cache.open_regions()?;

    let results: Vec<bool> = stream::iter(self.options.manifest.iter().cloned())
      .map(|url| self.precache(url))
      .buffer_unordered(INSTALL_CONCURRENCY)
      .collect()
      .await;

    let cached = results.iter().filter(|ok| **ok).count();
    let report = InstallReport {
      cached,
      failed: results.len() - cached,
    };

    info!(
      generation = self.cache.generation(),
      cached = report.cached,
      failed = report.failed,
      "Shell installed"
    );
    self.enter(LifecycleState::Installed)?;
    Ok(report)
  }

  async fn precache(&self, url: Url) -> bool {
    let request = Request::get(url);
    let response = match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        warn!("Failed to cache {}: status {}", request.url, response.status);
        return false;
      }
      Err(e) => {
        warn!("Failed to cache {}: {}", request.url, e);
        return false;
      }
    };

    match self.cache.put(RegionKind::Shell, &request, &response) {
      Ok(Ok(())) => true,
      Ok(Err(skip)) => {
        warn!("Failed to cache {}: {:?}", request.url, skip);
        false
      }
      Err(e) => {
        warn!("Failed to cache {}: {}", request.url, e);
        false
      }
    }
  }

  /// Delete every region of other generations, then become active.
  ///
  /// Garbage collection finishes before the state flips, so nothing is
  /// served from a stale region once active.
  pub fn activate(&self) -> Result<()> {
    self.enter(LifecycleState::Activating)?;

    for region in self.cache.stale_regions()? {
      self.cache.delete_region(&region.name)?;
      info!("Deleted old cache region {}", region.name);
    }

    for tag in self.registry.retire_others(self.cache.generation())? {
      info!("Generation {} is now redundant", tag);
    }

    self.enter(LifecycleState::Active)
  }

  fn enter(&self, next: LifecycleState) -> Result<()> {
    let current = self.status.borrow().state;
    // A fresh controller starts in Installing; re-entering it is the install step.
    if next != current && !current.can_transition_to(next) {
      return Err(eyre!("Invalid lifecycle transition {} -> {}", current, next));
    }

    self.registry.record(self.cache.generation(), next)?;
    self.status.send_modify(|s| s.state = next);
    debug!(generation = self.cache.generation(), state = %next, "Lifecycle transition");
    Ok(())
  }

  /// Run one drain pass and apply the retention policy.
  pub async fn drain_now(&self) -> Result<DrainReport> {
    let report = self.drainer.drain().await?;

    if report.attempted > 0 {
      self.status.send_modify(|s| {
        s.last_drain = Some(report);
        s.last_drain_at = Some(Utc::now());
      });
    }

    if let Some(retention) = self.options.retention {
      match self.drainer.outbox().prune_synced(retention) {
        Ok(0) => {}
        Ok(pruned) => info!("Pruned {} synced offline sales", pruned),
        Err(e) => warn!("Failed to prune outbox: {}", e),
      }
    }

    Ok(report)
  }

  /// Process signals until shutdown.
  pub async fn run(&self, mut signals: SignalReceiver) {
    let mut ticker = self.options.drain_interval.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker
    });

    // Whatever survived a restart goes out as soon as possible.
    self.drain_logged().await;

    loop {
      let signal = tokio::select! {
        signal = signals.recv() => signal,
        _ = tick(&mut ticker) => Some(Signal::BackgroundSync),
      };

      match signal {
        Some(Signal::ConnectivityRestored) => {
          info!("Connectivity restored");
          self.set_online(true);
          self.drain_logged().await;
        }
        Some(Signal::Reachability(reachable)) => {
          let was_online = self.status.borrow().online;
          self.set_online(reachable);
          if reachable && !was_online {
            info!("Upstream reachable again");
            self.drain_logged().await;
          } else if !reachable && was_online {
            warn!("Upstream unreachable; sales will be queued");
          }
        }
        Some(Signal::SaleAccepted) => {
          self.set_online(true);
          self.drain_logged().await;
        }
        Some(Signal::BackgroundSync) => self.drain_logged().await,
        Some(Signal::Shutdown) | None => break,
      }
    }

    debug!("Controller stopped");
  }

  async fn drain_logged(&self) {
    if let Err(e) = self.drain_now().await {
      error!("Drain failed: {}", e);
    }
  }

  fn set_online(&self, online: bool) {
    self.status.send_if_modified(|s| {
      let changed = s.online != online;
      s.online = online;
      changed
    });
  }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheRegion, SqliteStorage};
  use crate::db::Database;
  use crate::event;
  use crate::net::ResponseSnapshot;
  use crate::outbox::Outbox;
  use crate::testing::FakeNetwork;
  use reqwest::Method;
  use serde_json::json;

  const SALE: &str = "http://pos.local/pos/procesar-venta/";

  fn controller(
    db: &Arc<Database>,
    network: &Arc<FakeNetwork>,
    generation: &str,
    options: ControllerOptions,
  ) -> Controller {
    let cache = Arc::new(CacheStore::new(
      Arc::new(SqliteStorage::new(Arc::clone(db))),
      "cantina",
      generation,
    ));
    let outbox = Arc::new(Outbox::new(Arc::clone(db)));
    let drainer = Arc::new(Drainer::new(
      outbox,
      network.clone(),
      Url::parse(SALE).unwrap(),
    ));
    Controller::new(
      cache,
      GenerationRegistry::new(Arc::clone(db)),
      drainer,
      network.clone(),
      options,
    )
  }

  fn options(manifest: &[&str]) -> ControllerOptions {
    ControllerOptions {
      manifest: manifest.iter().map(|u| Url::parse(u).unwrap()).collect(),
      retention: None,
      drain_interval: None,
    }
  }

  #[tokio::test]
  async fn test_install_tolerates_failing_assets() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::GET, "http://pos.local/pos/", ResponseSnapshot::new(200, "shell"));
    let controller = controller(
      &db,
      &network,
      "v1",
      options(&["http://pos.local/pos/", "http://pos.local/static/missing.js"]),
    );

    let report = controller.start().await.unwrap();

    assert_eq!(report, InstallReport { cached: 1, failed: 1 });
    assert_eq!(controller.status().state, LifecycleState::Active);
    let shell = CacheRegion::new("cantina", RegionKind::Shell, "v1");
    assert_eq!(controller.cache.entry_count(&shell.name).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_activation_collects_old_generation() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::GET, "http://pos.local/pos/", ResponseSnapshot::new(200, "shell"));

    let v1 = controller(&db, &network, "v1", options(&["http://pos.local/pos/"]));
    v1.start().await.unwrap();
    let products = Request::get(Url::parse("http://pos.local/api/v1/productos/").unwrap());
    v1.cache
      .put(RegionKind::RuntimeData, &products, &ResponseSnapshot::new(200, "[]"))
      .unwrap()
      .unwrap();

    let v2 = controller(&db, &network, "v2", options(&["http://pos.local/pos/"]));
    v2.start().await.unwrap();

    let names: Vec<String> = v2.cache.regions().unwrap().into_iter().map(|r| r.name).collect();
    assert!(names.iter().all(|n| n.ends_with("-v2")), "{names:?}");
    assert!(names.contains(&"cantina-shell-v2".to_string()));
    assert_eq!(v2.cache.entry_count("cantina-shell-v2").unwrap(), 1);
    assert_eq!(v2.cache.entry_count("cantina-data-v1").unwrap(), 0);

    let registry = GenerationRegistry::new(Arc::clone(&db));
    assert_eq!(registry.state("v1").unwrap(), Some(LifecycleState::Redundant));
    assert_eq!(registry.state("v2").unwrap(), Some(LifecycleState::Active));
    assert_eq!(v1.stored_state().unwrap(), Some(LifecycleState::Redundant));
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    let controller = controller(&db, &network, "v1", options(&[]));
    assert!(controller.activate().is_err());
  }

  #[tokio::test]
  async fn test_reconnection_signal_drains_outbox() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::POST, SALE, ResponseSnapshot::new(200, "{}"));
    network.set_online(false);
    let controller = Arc::new(controller(&db, &network, "v1", options(&[])));
    controller.start().await.unwrap();
    let record = controller
      .drainer()
      .outbox()
      .enqueue(&json!({"total": 10}))
      .unwrap();

    let (tx, rx) = event::channel();
    let mut status = controller.subscribe();
    let runner = {
      let controller = Arc::clone(&controller);
      tokio::spawn(async move { controller.run(rx).await })
    };

    // The startup drain fails while offline.
    status.wait_for(|s| s.last_drain.is_some()).await.unwrap();
    assert!(!controller.drainer().outbox().get(record.id).unwrap().unwrap().synced);

    network.set_online(true);
    tx.send(Signal::ConnectivityRestored).unwrap();
    status
      .wait_for(|s| s.last_drain.map(|r| r.succeeded) == Some(1))
      .await
      .unwrap();

    tx.send(Signal::Shutdown).unwrap();
    runner.await.unwrap();

    assert!(controller.drainer().outbox().get(record.id).unwrap().unwrap().synced);
    assert_eq!(network.count(Method::POST, SALE), 1);
  }

  #[tokio::test]
  async fn test_reachability_transition_triggers_drain() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::POST, SALE, ResponseSnapshot::new(201, "{}"));
    let controller = Arc::new(controller(&db, &network, "v1", options(&[])));
    controller.start().await.unwrap();

    let (tx, rx) = event::channel();
    let mut status = controller.subscribe();
    let runner = {
      let controller = Arc::clone(&controller);
      tokio::spawn(async move { controller.run(rx).await })
    };

    tx.send(Signal::Reachability(false)).unwrap();
    status.wait_for(|s| !s.online).await.unwrap();

    controller.drainer().outbox().enqueue(&json!({"total": 3})).unwrap();
    tx.send(Signal::Reachability(true)).unwrap();
    status
      .wait_for(|s| s.online && s.last_drain.is_some())
      .await
      .unwrap();

    tx.send(Signal::Shutdown).unwrap();
    runner.await.unwrap();
    assert!(controller.drainer().outbox().pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_periodic_trigger_drains() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::POST, SALE, ResponseSnapshot::new(200, "{}"));
    let mut opts = options(&[]);
    opts.drain_interval = Some(Duration::from_millis(20));
    let controller = Arc::new(controller(&db, &network, "v1", opts));
    controller.start().await.unwrap();

    // Pending before the loop starts, so the startup drain tries it and fails.
    network.set_online(false);
    controller.drainer().outbox().enqueue(&json!({"total": 4})).unwrap();

    let (tx, rx) = event::channel();
    let mut status = controller.subscribe();
    let runner = {
      let controller = Arc::clone(&controller);
      tokio::spawn(async move { controller.run(rx).await })
    };
    status
      .wait_for(|s| s.last_drain.is_some_and(|r| r.failed == 1))
      .await
      .unwrap();

    // No signal is sent from here on: only the timer can retry.
    network.set_online(true);
    status
      .wait_for(|s| s.last_drain.is_some_and(|r| r.succeeded == 1))
      .await
      .unwrap();

    tx.send(Signal::Shutdown).unwrap();
    runner.await.unwrap();
    assert!(controller.drainer().outbox().pending().unwrap().is_empty());
    assert_eq!(network.count(Method::POST, SALE), 1);
  }

  #[tokio::test]
  async fn test_retention_prunes_after_drain() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = FakeNetwork::new();
    network.respond(Method::POST, SALE, ResponseSnapshot::new(200, "{}"));
    let mut opts = options(&[]);
    // Negative window: anything synced is already past retention.
    opts.retention = Some(chrono::Duration::seconds(-60));
    let controller = controller(&db, &network, "v1", opts);
    controller.drainer().outbox().enqueue(&json!({"total": 4})).unwrap();

    let report = controller.drain_now().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(controller.drainer().outbox().records().unwrap().is_empty());
  }
}
