mod cache;
mod config;
mod db;
mod error;
mod event;
mod interceptor;
mod lifecycle;
mod logging;
mod net;
mod outbox;
mod router;
mod server;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheRegion, CacheStorage, CacheStore, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::Signal;
use crate::interceptor::Interceptor;
use crate::lifecycle::{Controller, ControllerOptions, GenerationRegistry};
use crate::net::{HttpUpstream, Network};
use crate::outbox::{Drainer, Outbox};
use crate::router::StrategyRouter;

#[derive(Parser, Debug)]
#[command(name = "posw")]
#[command(about = "An offline-capable caching gateway for point-of-sale clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./posw.yaml, then $XDG_CONFIG_HOME/posw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Base URL of the origin server
  #[arg(short, long)]
  upstream: Option<Url>,

  /// Generation tag of the cached assets
  #[arg(short, long)]
  generation: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the gateway (default)
  Serve,
  /// Replay pending sales once and exit
  Drain,
  /// Print outbox counts and cache regions
  Status,
}

/// Shared components, wired once for every subcommand.
struct Components {
  cache: Arc<CacheStore>,
  outbox: Arc<Outbox>,
  network: Arc<dyn Network>,
  controller: Arc<Controller>,
}

impl Components {
  fn build(config: &Config, db: Arc<Database>) -> Result<Self> {
    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(Arc::clone(&db)))
    } else {
      warn!("Cache disabled; every lookup will miss");
      Arc::new(NoopStorage)
    };
    let cache = Arc::new(CacheStore::new(
      storage,
      &config.cache_prefix,
      &config.generation,
    ));

    let network: Arc<dyn Network> = Arc::new(HttpUpstream::new()?);
    let outbox = Arc::new(Outbox::new(Arc::clone(&db)));
    let drainer = Arc::new(
      Drainer::new(Arc::clone(&outbox), Arc::clone(&network), config.sale_url()?)
        .with_idempotency_header(config.outbox.idempotency_header.clone()),
    );

    let controller = Arc::new(Controller::new(
      Arc::clone(&cache),
      GenerationRegistry::new(db),
      drainer,
      Arc::clone(&network),
      ControllerOptions {
        manifest: config.manifest_urls(),
        retention: config.outbox.retention(),
        drain_interval: config.outbox.drain_interval(),
      },
    ));

    Ok(Self {
      cache,
      outbox,
      network,
      controller,
    })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?.with_overrides(
    args.listen,
    args.upstream,
    args.generation,
  )?;

  let data_dir = config.data_dir()?;
  let log_dir = data_dir.join("logs");
  let _log_guard = logging::init(config.log.file.then_some(log_dir.as_path()))?;

  let db = Arc::new(Database::open(&data_dir)?);
  let components = Components::build(&config, db)?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(config, components).await,
    Command::Drain => {
      let report = components.controller.drain_now().await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
    Command::Status => print_status(&components),
  }
}

async fn serve(config: Config, components: Components) -> Result<()> {
  let Components {
    cache,
    outbox,
    network,
    controller,
  } = components;

  let report = controller.start().await?;
  info!(
    "Generation {} active ({} assets cached, {} failed)",
    cache.generation(),
    report.cached,
    report.failed
  );

  let (signals, receiver) = event::channel();

  let run = {
    let controller = Arc::clone(&controller);
    tokio::spawn(async move { controller.run(receiver).await })
  };
  let monitor = event::spawn_connectivity_monitor(
    Arc::clone(&network),
    config.probe_url()?,
    config.connectivity.probe_interval(),
    signals.clone(),
  );

  let interceptor = Arc::new(Interceptor::new(
    StrategyRouter::new(&config.routes),
    cache,
    outbox,
    network,
    signals.clone(),
  ));

  let state = server::AppState {
    interceptor: Arc::clone(&interceptor),
    controller,
    signals: signals.clone(),
    upstream: config.upstream.clone(),
  };

  let result = server::serve(config.listen, state, shutdown_signal()).await;

  info!("Shutting down");
  monitor.abort();
  let _ = signals.send(Signal::Shutdown);
  if let Err(e) = run.await {
    warn!("Controller task ended abnormally: {}", e);
  }
  interceptor.wait_for_refreshes().await;

  result
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("Failed to listen for ctrl-c: {}", e);
    std::future::pending::<()>().await;
  }
}

fn print_status(components: &Components) -> Result<()> {
  let counts = components.outbox.counts()?;
  let regions = components
    .cache
    .regions()?
    .into_iter()
    .map(|region: CacheRegion| {
      let entries = components.cache.entry_count(&region.name)?;
      Ok(json!({
        "name": region.name,
        "kind": region.kind.as_str(),
        "generation": region.generation,
        "entries": entries,
      }))
    })
    .collect::<Result<Vec<_>>>()?;

  let status = json!({
    "generation": components.cache.generation(),
    "state": components.controller.stored_state()?,
    "outbox": counts,
    "regions": regions,
  });
  let rendered = serde_json::to_string_pretty(&status)
    .map_err(|e| eyre!("Failed to render status: {}", e))?;
  println!("{}", rendered);
  Ok(())
}
