//! Buffered producer with per-message acknowledgements.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BrokerError, MessageLog};

/// Resolves with the offset once the message is durable.
pub type AckReceiver = oneshot::Receiver<Result<i64, BrokerError>>;

struct ProducerMessage {
  topic: String,
  key: String,
  payload: Vec<u8>,
  ack: oneshot::Sender<Result<i64, BrokerError>>,
}

/// Accepts messages into a bounded send buffer; a background task drains the
/// buffer into the [`MessageLog`] and answers each message with its offset.
#[derive(Clone)]
pub struct Producer {
  input: mpsc::Sender<ProducerMessage>,
}

impl Producer {
  /// Start the flush task. It stops when `shutdown` is cancelled or every
  /// producer handle is dropped.
  pub fn spawn(
    log: Arc<dyn MessageLog>,
    buffer: usize,
    shutdown: CancellationToken,
  ) -> (Self, JoinHandle<()>) {
    let (input, rx) = mpsc::channel::<ProducerMessage>(buffer.max(1));
    let handle = Self::drain(log, rx, shutdown);
    (Self { input }, handle)
  }

  fn drain(
    log: Arc<dyn MessageLog>,
    mut rx: mpsc::Receiver<ProducerMessage>,
    shutdown: CancellationToken,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        let message = tokio::select! {
          _ = shutdown.cancelled() => break,
          message = rx.recv() => match message {
            Some(message) => message,
            None => break,
          },
        };

        if message.ack.is_closed() {
          debug!(topic = %message.topic, key = %message.key, "sender gave up, message dropped");
          continue;
        }

        let result = tokio::select! {
          _ = shutdown.cancelled() => break,
          result = log.append(&message.topic, &message.key, &message.payload) => result,
        };
        match &result {
          Ok(offset) => debug!(topic = %message.topic, key = %message.key, offset, "message written"),
          Err(e) => warn!(topic = %message.topic, "Failed to write message: {}", e),
        }
        // The sender may have given up waiting.
        let _ = message.ack.send(result);
      }
      debug!("producer stopped");
    })
  }

  /// Wait for room in the send buffer. The returned receiver resolves once
  /// the log has accepted the message.
  pub async fn enqueue(
    &self,
    topic: &str,
    key: &str,
    payload: Vec<u8>,
  ) -> Result<AckReceiver, BrokerError> {
    let (ack, ack_rx) = oneshot::channel();
    let message = ProducerMessage {
      topic: topic.to_string(),
      key: key.to_string(),
      payload,
      ack,
    };
    self
      .input
      .send(message)
      .await
      .map_err(|_| BrokerError::Closed)?;
    Ok(ack_rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::SqliteLog;
  use std::time::Duration;

  #[tokio::test]
  async fn test_enqueue_and_ack() {
    let log = Arc::new(SqliteLog::open_in_memory().unwrap());
    let shutdown = CancellationToken::new();
    let (producer, _handle) = Producer::spawn(log.clone(), 4, shutdown.clone());

    let ack = producer.enqueue("t", "1", b"x".to_vec()).await.unwrap();
    let offset = ack.await.unwrap().unwrap();

    let delivery = log
      .claim("t", "g", Duration::from_secs(30))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(delivery.offset, offset);
    assert_eq!(delivery.key, "1");
    shutdown.cancel();
  }

  #[tokio::test]
  async fn test_abandoned_message_is_not_written() {
    let log = Arc::new(SqliteLog::open_in_memory().unwrap());
    let shutdown = CancellationToken::new();
    // Queue a message whose sender already gave up, then start draining.
    let (input, rx) = mpsc::channel::<ProducerMessage>(1);
    let (ack, ack_rx) = oneshot::channel();
    input
      .send(ProducerMessage {
        topic: "t".to_string(),
        key: "1".to_string(),
        payload: b"x".to_vec(),
        ack,
      })
      .await
      .unwrap();
    drop(ack_rx);
    drop(input);

    let handle = Producer::drain(log.clone(), rx, shutdown);
    handle.await.unwrap();
    assert!(log
      .claim("t", "g", Duration::from_secs(30))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_enqueue_after_shutdown_fails() {
    let log = Arc::new(SqliteLog::open_in_memory().unwrap());
    let shutdown = CancellationToken::new();
    let (producer, handle) = Producer::spawn(log, 4, shutdown.clone());
    shutdown.cancel();
    handle.await.unwrap();

    let err = producer.enqueue("t", "1", b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, BrokerError::Closed));
  }
}
