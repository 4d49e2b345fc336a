//! Cache policy for active currencies and period reports.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::lru::LruCache;
use super::traits::{currency_key, report_key, CacheResult, CachedValue, ReportLookup};
use crate::period::Period;
use crate::report::{DispatchError, ReportRequest, ReportRequester};
use crate::store::{Report, Store, StoreError};

/// Sits between the command layer and the store, and owns both caches.
///
/// Report misses are never computed inline: they are handed to the
/// [`ReportRequester`] and the caller gets [`ReportLookup::Pending`].
pub struct CacheOrchestrator {
  store: Arc<dyn Store>,
  currencies: LruCache<CachedValue>,
  reports: LruCache<CachedValue>,
  requester: Arc<dyn ReportRequester>,
}

impl CacheOrchestrator {
  pub fn new(
    store: Arc<dyn Store>,
    currencies: LruCache<CachedValue>,
    reports: LruCache<CachedValue>,
    requester: Arc<dyn ReportRequester>,
  ) -> Self {
    Self {
      store,
      currencies,
      reports,
      requester,
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  fn fill(cache: &LruCache<CachedValue>, key: &str, value: CachedValue) {
    let evicted = cache.add(key, value);
    debug!(cache = cache.name(), key, evicted, len = cache.len(), "filled");
  }

  /// Active currency of `user_id`, from cache or store.
  ///
  /// Store failures are returned as-is and nothing is cached.
  pub fn active_currency(&self, user_id: i64) -> Result<CacheResult<String>, StoreError> {
    let key = currency_key(user_id);
    match self.currencies.get(&key) {
      Ok(CachedValue::Currency(code)) => {
        debug!(cache = self.currencies.name(), user_id, "hit");
        return Ok(CacheResult::from_cache(code));
      }
      Ok(_) => {
        self.currencies.delete(&key);
      }
      Err(miss) => debug!(cache = self.currencies.name(), "{}", miss),
    }

    let code = self.store.active_currency(user_id)?;
    Self::fill(&self.currencies, &key, CachedValue::Currency(code.clone()));
    Ok(CacheResult::from_store(code))
  }

  /// Persist a new active currency and overwrite the cached one.
  pub fn set_active_currency(&self, user_id: i64, code: &str) -> Result<(), StoreError> {
    self.store.set_active_currency(user_id, code)?;
    Self::fill(
      &self.currencies,
      &currency_key(user_id),
      CachedValue::Currency(code.to_string()),
    );
    Ok(())
  }

  /// Report for `period` over `start..=end`.
  ///
  /// A cached report is served only while its earliest spending is not
  /// before `start`; otherwise it is dropped and the report is requested
  /// from the workers.
  pub async fn report(
    &self,
    user_id: i64,
    period: Period,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<ReportLookup, DispatchError> {
    let key = report_key(user_id, period);
    match self.reports.get(&key) {
      Ok(CachedValue::Report(report)) if report.min_date >= start => {
        debug!(cache = self.reports.name(), user_id, %period, "hit");
        return Ok(ReportLookup::Ready(report));
      }
      Ok(_) => {
        self.reports.delete(&key);
        debug!(cache = self.reports.name(), user_id, %period, "invalidated on read");
      }
      Err(miss) => debug!(cache = self.reports.name(), "{}", miss),
    }

    let request = ReportRequest {
      user_id,
      period,
      date_first: start,
      date_last: end,
    };
    self.requester.request_report(request).await?;
    info!(user_id, %period, "report requested");
    Ok(ReportLookup::Pending)
  }

  /// Store a computed report for later reads.
  pub fn remember_report(&self, user_id: i64, period: Period, report: Report) {
    Self::fill(
      &self.reports,
      &report_key(user_id, period),
      CachedValue::Report(report),
    );
  }

  /// Drop cached reports a new spending dated `date` may affect.
  pub fn invalidate_on_new_spending(&self, user_id: i64, date: DateTime<Utc>) -> Vec<Period> {
    self.invalidate_at(user_id, date, Utc::now())
  }

  /// Deletes the entry of every period whose rolling boundary (`now` minus
  /// the period) is at or before `date`. Coarse on purpose: no attempt is
  /// made to match the exact cached window. Returns the periods hit.
  pub fn invalidate_at(
    &self,
    user_id: i64,
    date: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Vec<Period> {
    let mut hit = Vec::new();
    for period in Period::ALL {
      if date >= period.start_before(now) {
        let removed = self.reports.delete(&report_key(user_id, period));
        debug!(cache = self.reports.name(), user_id, %period, removed, "invalidated on write");
        hit.push(period);
      }
    }
    hit
  }

  #[cfg(test)]
  pub(crate) fn cached_report(&self, user_id: i64, period: Period) -> Option<Report> {
    match self.reports.get(&report_key(user_id, period)) {
      Ok(CachedValue::Report(report)) => Some(report),
      _ => None,
    }
  }
}
