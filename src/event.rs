use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::net::{Network, Request};

/// Inputs of the lifecycle controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
  /// The host reports the connection is back
  ConnectivityRestored,
  /// Result of an upstream probe or of an observed request
  Reachability(bool),
  /// Background sync trigger (tag "sync-sales")
  BackgroundSync,
  /// A sale reached the server; earlier failures may be waiting
  SaleAccepted,
  /// Stop the controller loop
  Shutdown,
}

pub type SignalSender = mpsc::UnboundedSender<Signal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

pub fn channel() -> (SignalSender, SignalReceiver) {
  mpsc::unbounded_channel()
}

/// Probes the upstream on a fixed period and reports reachability.
///
/// Any response, whatever its status, counts as reachable.
pub fn spawn_connectivity_monitor(
  network: Arc<dyn Network>,
  probe_url: Url,
  period: Duration,
  tx: SignalSender,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let reachable = match network.fetch(&Request::get(probe_url.clone())).await {
        Ok(_) => true,
        Err(e) => !e.is_unreachable(),
      };
      debug!(reachable, "Upstream probe");
      if tx.send(Signal::Reachability(reachable)).is_err() {
        break;
      }
    }
  })
}
