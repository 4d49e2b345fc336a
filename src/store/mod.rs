//! System of record for spendings, categories, limits and currencies.

mod sqlite;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Currency assigned to users that never picked one. Amounts are stored in it.
pub const BASE_CURRENCY: &str = "RUB";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("month limit exceeded")]
  LimitExceeded,
  #[error("month limit not set")]
  LimitNotSet,
  #[error("category exists")]
  CategoryExists,
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),
  #[error("corrupt store: {0}")]
  Corrupt(String),
}

/// Sum of one category's spendings inside a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySum {
  pub category: String,
  pub sum: Decimal,
}

/// Spending report for a window: per-category sums ordered by category name,
/// plus the earliest spending date that contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
  pub by_category: Vec<CategorySum>,
  pub min_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
  pub name: String,
}

/// Store contract used by the cache orchestrator, the command layer and the
/// report worker.
pub trait Store: Send + Sync {
  /// Active currency code; users without one get [`BASE_CURRENCY`] recorded.
  fn active_currency(&self, user_id: i64) -> Result<String, StoreError>;

  fn set_active_currency(&self, user_id: i64, code: &str) -> Result<(), StoreError>;

  /// Report over `start..=end`.
  fn report_period(
    &self,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Report, StoreError>;

  /// Record a spending (amount in [`BASE_CURRENCY`]), creating the category on
  /// first use. Fails with [`StoreError::LimitExceeded`] without writing
  /// anything if the month limit would be breached.
  fn create_spending(
    &self,
    user_id: i64,
    category: &str,
    amount: Decimal,
    date: DateTime<Utc>,
  ) -> Result<(), StoreError>;

  fn create_category(&self, user_id: i64, name: &str) -> Result<(), StoreError>;

  fn categories(&self, user_id: i64) -> Result<Vec<Category>, StoreError>;

  fn limit(&self, user_id: i64) -> Result<Decimal, StoreError>;

  fn set_limit(&self, user_id: i64, amount: Decimal) -> Result<(), StoreError>;

  fn drop_limit(&self, user_id: i64) -> Result<(), StoreError>;
}
