//! Deferred report computation.
//!
//! The origin service turns report cache misses into [`ReportRequest`]s and
//! publishes them through the [`ReportDispatcher`]. A [`ReportWorker`]
//! recomputes the report from the store and posts a [`ReportResult`] back to
//! the origin's `/reports` endpoint.

mod delivery;
mod dispatcher;
mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::store::Report;

pub use delivery::{DeliveryError, HttpDelivery, ReportDelivery};
pub use dispatcher::{DispatchError, DispatchTimeouts, ReportDispatcher};
pub use worker::{ReportWorker, WorkerError, WorkerOptions};

/// Immutable description of a report to compute. Recomputing it is
/// side-effect free, so duplicate deliveries are harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
  pub user_id: i64,
  pub period: Period,
  pub date_first: DateTime<Utc>,
  pub date_last: DateTime<Utc>,
}

/// A computed report on its way back to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResult {
  pub user_id: i64,
  pub period: Period,
  pub report: Report,
}

/// Hands report requests to whoever computes them.
#[async_trait]
pub trait ReportRequester: Send + Sync {
  async fn request_report(&self, request: ReportRequest) -> Result<(), DispatchError>;
}
