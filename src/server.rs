//! HTTP surface of the bot process.
//!
//! `POST /reports` receives computed reports from workers, `POST /messages`
//! accepts chat messages, `GET /health` answers liveness probes.

use axum::{
  extract::State,
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bot::{Message, Model};
use crate::error::ServiceError;
use crate::report::ReportResult;

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
  pub model: Arc<Model>,
  /// Keep delivered reports in the report cache
  pub populate_reports: bool,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/reports", post(receive_report))
    .route("/messages", post(receive_message))
    .route("/health", get(health))
    .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
  listener: TcpListener,
  state: AppState,
  shutdown: CancellationToken,
) -> std::io::Result<()> {
  if let Ok(addr) = listener.local_addr() {
    info!("HTTP server listening on http://{}", addr);
  }
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}

struct ApiError(ServiceError);

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self.0 {
      ServiceError::Send(_) => StatusCode::BAD_GATEWAY,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": self.0.user_message() }))).into_response()
  }
}

async fn receive_report(
  State(state): State<AppState>,
  Json(result): Json<ReportResult>,
) -> Result<Json<serde_json::Value>, ApiError> {
  info!(user_id = result.user_id, period = %result.period, "received report");

  if state.populate_reports {
    state
      .model
      .cache()
      .remember_report(result.user_id, result.period, result.report.clone());
  }

  state.model.deliver_report(&result).await.map_err(|e| {
    error!(user_id = result.user_id, "Failed to deliver report: {}", e);
    ApiError(e)
  })?;
  Ok(Json(json!({ "answer": "ok" })))
}

async fn receive_message(
  State(state): State<AppState>,
  Json(message): Json<Message>,
) -> Result<Json<serde_json::Value>, ApiError> {
  state.model.incoming_message(&message).await.map_err(|e| {
    error!(user_id = message.user_id, "Failed to answer message: {}", e);
    ApiError(e)
  })?;
  Ok(Json(json!({ "answer": "ok" })))
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheOrchestrator, LruCache};
  use crate::messenger::{MessageSender, SendError};
  use crate::period::Period;
  use crate::rates::CbrRates;
  use crate::report::{DispatchError, ReportRequest, ReportRequester};
  use crate::store::{CategorySum, Report, SqliteStore};
  use async_trait::async_trait;
  use axum::body::Body;
  use axum::http::Request;
  use chrono::Utc;
  use rust_decimal::Decimal;
  use std::num::NonZeroUsize;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;
  use tower::ServiceExt;

  struct NoRequests;

  #[async_trait]
  impl ReportRequester for NoRequests {
    async fn request_report(&self, _: ReportRequest) -> Result<(), DispatchError> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct Outbox {
    sent: Mutex<Vec<(i64, String)>>,
    down: AtomicBool,
  }

  #[async_trait]
  impl MessageSender for Outbox {
    async fn send_message(&self, user_id: i64, text: &str) -> Result<(), SendError> {
      if self.down.load(Ordering::SeqCst) {
        return Err(SendError::Refused("502 Bad Gateway".to_string()));
      }
      self.sent.lock().unwrap().push((user_id, text.to_string()));
      Ok(())
    }
  }

  fn state(populate_reports: bool) -> (AppState, Arc<Outbox>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let capacity = NonZeroUsize::new(8).unwrap();
    let cache = Arc::new(CacheOrchestrator::new(
      store,
      LruCache::new("currency", capacity),
      LruCache::new("report", capacity),
      Arc::new(NoRequests),
    ));
    let rates = Arc::new(CbrRates::new("http://127.0.0.1:9/unused", Duration::from_secs(1)).unwrap());
    let outbox = Arc::new(Outbox::default());
    let model = Arc::new(Model::new(cache, rates, outbox.clone()));
    (
      AppState {
        model,
        populate_reports,
      },
      outbox,
    )
  }

  fn report_body() -> String {
    serde_json::to_string(&ReportResult {
      user_id: 9,
      period: Period::Month,
      report: Report {
        by_category: vec![CategorySum {
          category: "taxi".to_string(),
          sum: Decimal::new(4200, 2),
        }],
        min_date: Utc::now(),
      },
    })
    .unwrap()
  }

  fn post_json(uri: &str, body: String) -> Request<Body> {
    Request::builder()
      .method("POST")
      .uri(uri)
      .header("content-type", "application/json")
      .body(Body::from(body))
      .unwrap()
  }

  async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
      .await
      .unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn test_receive_report_sends_formatted_message() {
    let (state, outbox) = state(false);
    let model = state.model.clone();
    let response = router(state)
      .oneshot(post_json("/reports", report_body()))
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "answer": "ok" }));
    assert_eq!(
      outbox.sent.lock().unwrap().as_slice(),
      &[(9, "*Report:*\ntaxi: 42.00 RUB".to_string())]
    );
    // Not written back unless configured.
    assert!(model.cache().cached_report(9, Period::Month).is_none());
  }

  #[tokio::test]
  async fn test_receive_report_populates_cache_when_enabled() {
    let (state, _) = state(true);
    let model = state.model.clone();
    let response = router(state)
      .oneshot(post_json("/reports", report_body()))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(model.cache().cached_report(9, Period::Month).is_some());
  }

  #[tokio::test]
  async fn test_send_failure_is_reported_to_caller() {
    let (state, outbox) = state(false);
    outbox.down.store(true, Ordering::SeqCst);
    let response = router(state)
      .oneshot(post_json("/reports", report_body()))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
      json_body(response).await,
      json!({ "error": crate::error::SERVICE_ERROR })
    );
  }

  #[tokio::test]
  async fn test_malformed_report_rejected() {
    let (state, outbox) = state(false);
    let response = router(state)
      .oneshot(post_json("/reports", "{\"user_id\": 1}".to_string()))
      .await
      .unwrap();
    assert!(response.status().is_client_error());
    assert!(outbox.sent.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_message_endpoint_replies() {
    let (state, outbox) = state(false);
    let response = router(state)
      .oneshot(post_json(
        "/messages",
        json!({ "user_id": 3, "text": "/listcat" }).to_string(),
      ))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
      outbox.sent.lock().unwrap().as_slice(),
      &[(3, "*Categories:* empty".to_string())]
    );
  }

  #[tokio::test]
  async fn test_health() {
    let (state, _) = state(false);
    let response = router(state)
      .oneshot(Request::get("/health").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "status": "ok" }));
  }
}
