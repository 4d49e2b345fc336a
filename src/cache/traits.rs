//! Core types for the caching system.

use crate::period::Period;
use crate::store::Report;

/// Value held by a cache instance.
///
/// Both caches share this type so a single [`super::LruCache`] implementation
/// serves them; a variant that does not match the reading path is a miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
  /// Active currency code of a user
  Currency(String),
  /// Previously computed report for a user and period
  Report(Report),
}

/// Currency cache key.
pub fn currency_key(user_id: i64) -> String {
  user_id.to_string()
}

/// Report cache key, e.g. `42_M`.
pub fn report_key(user_id: i64, period: Period) -> String {
  format!("{}_{}", user_id, period.tag())
}

/// Result of a cached lookup, including where the data came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn from_store(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Store,
    }
  }

  pub fn is_hit(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where looked-up data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the in-memory cache
  Cache,
  /// Loaded from the store (and cached)
  Store,
}

/// Outcome of a report read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLookup {
  /// A still-valid cached report
  Ready(Report),
  /// The report was handed to a worker; it will be delivered asynchronously
  Pending,
}
