//! Replay of pending outbox records.

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use url::Url;

use super::{Outbox, OutboxRecord};
use crate::error::FetchError;
use crate::net::{Network, Request, ResponseSnapshot};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Resubmits pending sales to the sale-submission endpoint.
///
/// Drains inside one process run one at a time, so a drain that starts while
/// another is running only sees what the first one left pending. Drains from
/// different processes sharing the database can still both submit the same
/// record; the endpoint has to tolerate that.
pub struct Drainer {
  outbox: Arc<Outbox>,
  network: Arc<dyn Network>,
  sale_url: Url,
  idempotency_header: Option<String>,
  running: Mutex<()>,
}

impl Drainer {
  pub fn new(outbox: Arc<Outbox>, network: Arc<dyn Network>, sale_url: Url) -> Self {
    Self {
      outbox,
      network,
      sale_url,
      idempotency_header: None,
      running: Mutex::new(()),
    }
  }

  /// Send each record's id in `header` so the server can de-duplicate replays.
  pub fn with_idempotency_header(mut self, header: Option<String>) -> Self {
    self.idempotency_header = header;
    self
  }

  pub fn outbox(&self) -> &Arc<Outbox> {
    &self.outbox
  }

  /// Attempt every pending record once, oldest first.
  ///
  /// A record that fails (unreachable or non-2xx) stays pending and doesn't
  /// stop the records after it.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _running = self.running.lock().await;

    let pending = self.outbox.pending()?;
    let mut report = DrainReport::default();
    if pending.is_empty() {
      return Ok(report);
    }

    info!("Synchronizing {} offline sales", pending.len());

    for record in pending {
      report.attempted += 1;
      match self.replay(&record).await {
        Ok(response) if response.is_success() => self.acknowledge(record.id, &mut report),
        // A success status whose body got lost is still an accepted sale.
        Err(FetchError::Incomplete { status, .. }) if (200..300).contains(&status) => {
          self.acknowledge(record.id, &mut report)
        }
        Ok(response) => {
          report.failed += 1;
          warn!(
            id = record.id,
            status = response.status,
            "Server rejected offline sale; keeping it pending"
          );
        }
        Err(e) => {
          report.failed += 1;
          warn!(id = record.id, "Offline sale not synchronized: {}", e);
        }
      }
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      "Drain finished"
    );
    Ok(report)
  }

  fn acknowledge(&self, id: i64, report: &mut DrainReport) {
    match self.outbox.mark_synced(id) {
      Ok(_) => {
        report.succeeded += 1;
        info!(id, "Offline sale synchronized");
      }
      Err(e) => {
        // Accepted upstream but still pending locally: it will be sent again.
        report.failed += 1;
        error!(id, "Failed to mark offline sale synced: {}", e);
      }
    }
  }

  async fn replay(&self, record: &OutboxRecord) -> Result<ResponseSnapshot, FetchError> {
    let mut request = Request::post_json(self.sale_url.clone(), &record.payload);
    if let Some(header) = &self.idempotency_header {
      request = request.with_header(header.clone(), record.id.to_string());
    }
    self.network.fetch(&request).await
  }
}
