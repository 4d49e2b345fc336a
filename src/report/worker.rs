//! Consumes report requests, recomputes reports and delivers them.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DeliveryError, ReportDelivery, ReportRequest, ReportResult};
use crate::broker::{BrokerError, Delivery, MessageLog};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("malformed report request: {0}")]
  MalformedRequest(#[from] serde_json::Error),
  #[error("failed to compute report: {0}")]
  Store(#[from] StoreError),
  #[error("failed to deliver report: {0}")]
  DeliveryFailure(#[from] DeliveryError),
  #[error("worker cancelled")]
  Cancelled,
  #[error(transparent)]
  Broker(#[from] BrokerError),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub topic: String,
  pub group: String,
  /// How long a claimed message stays invisible to other workers
  pub lease: Duration,
  /// Sleep between polls of an empty topic
  pub poll_interval: Duration,
}

impl Default for WorkerOptions {
  fn default() -> Self {
    Self {
      topic: "report-requests".to_string(),
      group: "report-requests-group".to_string(),
      lease: Duration::from_secs(30),
      poll_interval: Duration::from_millis(500),
    }
  }
}

pub struct ReportWorker {
  log: Arc<dyn MessageLog>,
  store: Arc<dyn Store>,
  delivery: Arc<dyn ReportDelivery>,
  options: WorkerOptions,
}

impl ReportWorker {
  pub fn new(
    log: Arc<dyn MessageLog>,
    store: Arc<dyn Store>,
    delivery: Arc<dyn ReportDelivery>,
    options: WorkerOptions,
  ) -> Self {
    Self {
      log,
      store,
      delivery,
      options,
    }
  }

  /// Start `concurrency` consumers sharing this worker's consumer group.
  pub fn spawn_pool(
    self: Arc<Self>,
    concurrency: usize,
    cancel: CancellationToken,
  ) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
      .map(|id| {
        let worker = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
          debug!(id, "report consumer started");
          worker.run(cancel).await;
          debug!(id, "report consumer stopped");
        })
      })
      .collect()
  }

  /// Consume until `cancel` fires. Failures are logged and the message is
  /// left uncommitted for redelivery.
  pub async fn run(&self, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
      match self.poll_once(&cancel).await {
        Ok(true) => {}
        Ok(false) => {
          tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(self.options.poll_interval) => {}
          }
        }
        Err(WorkerError::Cancelled) => break,
        Err(WorkerError::Broker(e)) => {
          warn!("Failed to poll report requests: {}", e);
          tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(self.options.poll_interval) => {}
          }
        }
        // Already logged by poll_once.
        Err(_) => {}
      }
    }
  }

  /// Claim and process at most one message. Returns whether one was found.
  pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<bool, WorkerError> {
    let claimed = self
      .log
      .claim(&self.options.topic, &self.options.group, self.options.lease)
      .await?;
    let Some(delivery) = claimed else {
      return Ok(false);
    };

    match self.handle(&delivery, cancel).await {
      Ok(()) => {
        self.log.commit(&self.options.group, &delivery).await?;
        Ok(true)
      }
      Err(WorkerError::MalformedRequest(e)) => {
        error!(
          offset = delivery.offset,
          attempt = delivery.attempt,
          "Dropping malformed report request: {}", e
        );
        Err(WorkerError::MalformedRequest(e))
      }
      Err(WorkerError::Cancelled) => Err(WorkerError::Cancelled),
      Err(e) => {
        warn!(
          offset = delivery.offset,
          attempt = delivery.attempt,
          "Report request failed, leaving for redelivery: {}", e
        );
        Err(e)
      }
    }
  }

  /// Decode, compute and deliver one request. Does not commit.
  pub async fn handle(
    &self,
    delivery: &Delivery,
    cancel: &CancellationToken,
  ) -> Result<(), WorkerError> {
    let request: ReportRequest = serde_json::from_slice(&delivery.payload)?;
    let report = self
      .store
      .report_period(request.user_id, request.date_first, request.date_last)?;
    let result = ReportResult {
      user_id: request.user_id,
      period: request.period,
      report,
    };

    tokio::select! {
      _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
      delivered = self.delivery.deliver(&result) => delivered?,
    }
    info!(
      user_id = request.user_id,
      period = %request.period,
      offset = delivery.offset,
      "report computed and delivered"
    );
    Ok(())
  }
}
