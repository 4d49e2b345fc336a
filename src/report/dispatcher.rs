//! Publishes report requests with bounded enqueue and acknowledgement waits.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ReportRequest, ReportRequester};
use crate::broker::{BrokerError, Producer};

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("report request was not accepted into the send buffer in time")]
  EnqueueTimeout,
  #[error("report request was not acknowledged by the broker in time")]
  AckTimeout,
  #[error("report dispatch cancelled")]
  Cancelled,
  #[error("producer closed")]
  Closed,
  #[error("failed to encode report request: {0}")]
  Encode(#[from] serde_json::Error),
  #[error(transparent)]
  Broker(BrokerError),
}

impl From<BrokerError> for DispatchError {
  fn from(e: BrokerError) -> Self {
    match e {
      BrokerError::Closed => DispatchError::Closed,
      other => DispatchError::Broker(other),
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
  /// Wait for room in the producer's send buffer
  pub enqueue: Duration,
  /// Wait for the broker to assign an offset
  pub ack: Duration,
}

impl Default for DispatchTimeouts {
  fn default() -> Self {
    Self {
      enqueue: Duration::from_secs(5),
      ack: Duration::from_secs(5),
    }
  }
}

/// Sends [`ReportRequest`]s to the worker topic.
pub struct ReportDispatcher {
  producer: Producer,
  topic: String,
  timeouts: DispatchTimeouts,
  shutdown: CancellationToken,
}

impl ReportDispatcher {
  pub fn new(
    producer: Producer,
    topic: impl Into<String>,
    timeouts: DispatchTimeouts,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      producer,
      topic: topic.into(),
      timeouts,
      shutdown,
    }
  }

  /// Publish `request`, returning the broker offset.
  ///
  /// The enqueue and acknowledge waits are bounded separately; an enqueue
  /// timeout never starts the acknowledge wait. Both end early with
  /// [`DispatchError::Cancelled`] on shutdown.
  pub async fn submit(&self, request: &ReportRequest) -> Result<i64, DispatchError> {
    let payload = serde_json::to_vec(request)?;
    let key = request.user_id.to_string();

    let ack = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => return Err(DispatchError::Cancelled),
      enqueued = timeout(self.timeouts.enqueue, self.producer.enqueue(&self.topic, &key, payload)) => {
        match enqueued {
          Ok(ack) => ack?,
          Err(_) => {
            warn!(user_id = request.user_id, period = %request.period, "report request enqueue timed out");
            return Err(DispatchError::EnqueueTimeout);
          }
        }
      }
    };

    let offset = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => return Err(DispatchError::Cancelled),
      acked = timeout(self.timeouts.ack, ack) => match acked {
        Ok(Ok(written)) => written?,
        Ok(Err(_)) => return Err(DispatchError::Closed),
        Err(_) => {
          warn!(user_id = request.user_id, period = %request.period, "report request ack timed out");
          return Err(DispatchError::AckTimeout);
        }
      },
    };

    debug!(user_id = request.user_id, period = %request.period, offset, "report request written");
    Ok(offset)
  }
}

#[async_trait]
impl ReportRequester for ReportDispatcher {
  async fn request_report(&self, request: ReportRequest) -> Result<(), DispatchError> {
    self.submit(&request).await.map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::{Delivery, MessageLog, SqliteLog};
  use crate::period::Period;
  use chrono::Utc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  /// A broker that accepts connections but never confirms a write.
  #[derive(Default)]
  struct StalledLog {
    appends_started: AtomicUsize,
  }

  #[async_trait]
  impl MessageLog for StalledLog {
    async fn append(&self, _: &str, _: &str, _: &[u8]) -> Result<i64, BrokerError> {
      self.appends_started.fetch_add(1, Ordering::SeqCst);
      std::future::pending().await
    }

    async fn claim(&self, _: &str, _: &str, _: Duration) -> Result<Option<Delivery>, BrokerError> {
      Ok(None)
    }

    async fn commit(&self, _: &str, _: &Delivery) -> Result<(), BrokerError> {
      Ok(())
    }
  }

  fn request(user_id: i64) -> ReportRequest {
    let (date_first, date_last) = Period::Year.window(Utc::now());
    ReportRequest {
      user_id,
      period: Period::Year,
      date_first,
      date_last,
    }
  }

  fn short() -> DispatchTimeouts {
    DispatchTimeouts {
      enqueue: Duration::from_millis(50),
      ack: Duration::from_millis(50),
    }
  }

  #[tokio::test]
  async fn test_submit_writes_to_log() {
    let log = Arc::new(SqliteLog::open_in_memory().unwrap());
    let shutdown = CancellationToken::new();
    let (producer, _) = Producer::spawn(log.clone(), 8, shutdown.clone());
    let dispatcher = ReportDispatcher::new(producer, "report-requests", short(), shutdown);

    let offset = dispatcher.submit(&request(1)).await.unwrap();
    let delivery = log
      .claim("report-requests", "g", Duration::from_secs(30))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(delivery.offset, offset);
    assert_eq!(delivery.key, "1");
    let decoded: ReportRequest = serde_json::from_slice(&delivery.payload).unwrap();
    assert_eq!(decoded.user_id, 1);
  }

  #[tokio::test]
  async fn test_ack_timeout_when_broker_never_confirms() {
    let log = Arc::new(StalledLog::default());
    let shutdown = CancellationToken::new();
    let (producer, _) = Producer::spawn(log.clone(), 8, shutdown.clone());
    let dispatcher = ReportDispatcher::new(producer, "report-requests", short(), shutdown);

    let err = dispatcher.submit(&request(1)).await.unwrap_err();
    assert!(matches!(err, DispatchError::AckTimeout));
    // Enqueue succeeded (the flush task picked the message up) but nothing
    // was ever written, so no worker can see it.
    assert_eq!(log.appends_started.load(Ordering::SeqCst), 1);
    assert!(log
      .claim("report-requests", "g", Duration::ZERO)
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_enqueue_timeout_when_buffer_full() {
    let log = Arc::new(StalledLog::default());
    let shutdown = CancellationToken::new();
    let (producer, _) = Producer::spawn(log.clone(), 1, shutdown.clone());
    let dispatcher = Arc::new(ReportDispatcher::new(
      producer,
      "report-requests",
      DispatchTimeouts {
        enqueue: Duration::from_millis(50),
        ack: Duration::from_secs(30),
      },
      shutdown,
    ));

    // First message is taken by the flush task and stalls in append; the
    // second one fills the single buffer slot.
    for user_id in 1..=2 {
      let dispatcher = dispatcher.clone();
      tokio::spawn(async move {
        let _ = dispatcher.submit(&request(user_id)).await;
      });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = dispatcher.submit(&request(3)).await.unwrap_err();
    assert!(matches!(err, DispatchError::EnqueueTimeout));
    assert_eq!(log.appends_started.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cancellation_aborts_pending_ack() {
    let log = Arc::new(StalledLog::default());
    let shutdown = CancellationToken::new();
    let (producer, _) = Producer::spawn(log, 8, shutdown.clone());
    let dispatcher = ReportDispatcher::new(
      producer,
      "report-requests",
      DispatchTimeouts {
        enqueue: Duration::from_secs(30),
        ack: Duration::from_secs(30),
      },
      shutdown.clone(),
    );

    let cancel = shutdown.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = dispatcher.submit(&request(1)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_cancellation_aborts_pending_enqueue() {
    let log = Arc::new(StalledLog::default());
    let (producer, _) = Producer::spawn(log.clone(), 1, CancellationToken::new());
    let cancel = CancellationToken::new();
    let dispatcher = Arc::new(ReportDispatcher::new(
      producer,
      "report-requests",
      DispatchTimeouts {
        enqueue: Duration::from_secs(30),
        ack: Duration::from_secs(30),
      },
      cancel.clone(),
    ));

    // One message stalls in append, the next fills the only buffer slot.
    for user_id in 1..=2 {
      let dispatcher = dispatcher.clone();
      tokio::spawn(async move {
        let _ = dispatcher.submit(&request(user_id)).await;
      });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = dispatcher.submit(&request(3)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(log.appends_started.load(Ordering::SeqCst), 1);
  }
}
