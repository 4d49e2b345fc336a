//! Durable at-least-once message channel.
//!
//! Messages are appended to a topic and consumed by named groups. A consumer
//! claims a message under a lease; if it does not commit before the lease
//! runs out the message becomes claimable again. After too many attempts a
//! message is parked in a dead-letter table instead of being handed out.

mod producer;
mod sqlite;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use producer::Producer;
pub use sqlite::SqliteLog;

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("broker database error: {0}")]
  Database(#[from] rusqlite::Error),
  #[error("broker unavailable: {0}")]
  Unavailable(String),
  #[error("producer closed")]
  Closed,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
  pub offset: i64,
  pub key: String,
  pub payload: Vec<u8>,
  /// 1 on first delivery
  pub attempt: u32,
}

/// Storage side of the channel.
#[async_trait]
pub trait MessageLog: Send + Sync {
  /// Durably append a message, returning its offset.
  async fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<i64, BrokerError>;

  /// Claim the oldest message `group` has neither committed nor currently
  /// leased.
  async fn claim(
    &self,
    topic: &str,
    group: &str,
    lease: Duration,
  ) -> Result<Option<Delivery>, BrokerError>;

  /// Acknowledge a claimed message for `group`.
  async fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError>;
}
