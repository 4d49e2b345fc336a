//! SQLite-backed [`MessageLog`].

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, trace};

use super::{BrokerError, Delivery, MessageLog};

const DEFAULT_MAX_DELIVERIES: u32 = 5;

const BROKER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    msg_offset INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    msg_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(topic, msg_offset);

-- Per consumer group progress. Rows appear on first claim.
CREATE TABLE IF NOT EXISTS deliveries (
    group_name TEXT NOT NULL,
    msg_offset INTEGER NOT NULL REFERENCES messages(msg_offset),
    attempts INTEGER NOT NULL DEFAULT 0,
    lease_until INTEGER,
    committed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (group_name, msg_offset)
);

CREATE TABLE IF NOT EXISTS dead_letters (
    group_name TEXT NOT NULL,
    msg_offset INTEGER NOT NULL,
    topic TEXT NOT NULL,
    msg_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    attempts INTEGER NOT NULL,
    dead_at INTEGER NOT NULL,
    PRIMARY KEY (group_name, msg_offset)
);
"#;

/// Message log in a SQLite file. Several processes may share the file;
/// claims run in immediate transactions so a message is leased to one
/// consumer at a time.
pub struct SqliteLog {
  conn: Mutex<Connection>,
  max_deliveries: u32,
}

impl SqliteLog {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create broker directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open broker log at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory log: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(BROKER_SCHEMA)
      .map_err(|e| eyre!("Failed to run broker migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
      max_deliveries: DEFAULT_MAX_DELIVERIES,
    })
  }

  /// Attempts after which a message is dead-lettered instead of redelivered.
  pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
    self.max_deliveries = max_deliveries.max(1);
    self
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, BrokerError> {
    self
      .conn
      .lock()
      .map_err(|e| BrokerError::Unavailable(format!("lock poisoned: {}", e)))
  }

  /// Dead-lettered messages of `group`, oldest first.
  pub fn dead_letters(&self, group: &str) -> Result<Vec<Delivery>, BrokerError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT msg_offset, msg_key, payload, attempts FROM dead_letters
       WHERE group_name = ? ORDER BY msg_offset",
    )?;
    let letters = stmt
      .query_map(params![group], |row| {
        Ok(Delivery {
          offset: row.get(0)?,
          key: row.get(1)?,
          payload: row.get(2)?,
          attempt: row.get(3)?,
        })
      })?
      .collect::<Result<_, _>>()?;
    Ok(letters)
  }

  #[cfg(test)]
  pub(crate) fn is_committed(&self, group: &str, offset: i64) -> bool {
    let conn = self.lock().unwrap();
    conn
      .query_row(
        "SELECT committed FROM deliveries WHERE group_name = ? AND msg_offset = ?",
        params![group, offset],
        |row| row.get::<_, i64>(0),
      )
      .optional()
      .unwrap()
      .map(|c| c != 0)
      .unwrap_or(false)
  }
}

#[async_trait]
impl MessageLog for SqliteLog {
  async fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<i64, BrokerError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO messages (topic, msg_key, payload, created_at) VALUES (?, ?, ?, ?)",
      params![topic, key, payload, Utc::now().timestamp_millis()],
    )?;
    let offset = conn.last_insert_rowid();
    trace!(topic, key, offset, "appended");
    Ok(offset)
  }

  async fn claim(
    &self,
    topic: &str,
    group: &str,
    lease: Duration,
  ) -> Result<Option<Delivery>, BrokerError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now().timestamp_millis();
    let lease_until = now + i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);

    let claimed = loop {
      let candidate: Option<(i64, String, Vec<u8>, u32)> = tx
        .query_row(
          "SELECT m.msg_offset, m.msg_key, m.payload, COALESCE(d.attempts, 0)
           FROM messages m
           LEFT JOIN deliveries d ON d.group_name = ?2 AND d.msg_offset = m.msg_offset
           WHERE m.topic = ?1
             AND COALESCE(d.committed, 0) = 0
             AND (d.lease_until IS NULL OR d.lease_until <= ?3)
           ORDER BY m.msg_offset
           LIMIT 1",
          params![topic, group, now],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

      let Some((offset, key, payload, attempts)) = candidate else {
        break None;
      };

      if attempts >= self.max_deliveries {
        error!(topic, group, offset, attempts, "message exceeded redelivery limit, dead-lettering");
        tx.execute(
          "INSERT OR REPLACE INTO dead_letters
             (group_name, msg_offset, topic, msg_key, payload, attempts, dead_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          params![group, offset, topic, key, payload, attempts, now],
        )?;
        tx.execute(
          "UPDATE deliveries SET committed = 1, lease_until = NULL
           WHERE group_name = ? AND msg_offset = ?",
          params![group, offset],
        )?;
        continue;
      }

      let attempt = attempts + 1;
      tx.execute(
        "INSERT INTO deliveries (group_name, msg_offset, attempts, lease_until)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (group_name, msg_offset) DO UPDATE SET attempts = ?3, lease_until = ?4",
        params![group, offset, attempt, lease_until],
      )?;
      break Some(Delivery {
        offset,
        key,
        payload,
        attempt,
      });
    };

    tx.commit()?;
    Ok(claimed)
  }

  async fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE deliveries SET committed = 1, lease_until = NULL
       WHERE group_name = ? AND msg_offset = ?",
      params![group, delivery.offset],
    )?;
    trace!(group, offset = delivery.offset, "committed");
    Ok(())
  }
}
