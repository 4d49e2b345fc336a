//! Outbound chat messages.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SendError {
  #[error("failed to send message: {0}")]
  Http(#[from] reqwest::Error),
  #[error("chat api refused message: {0}")]
  Refused(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
  async fn send_message(&self, user_id: i64, text: &str) -> Result<(), SendError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
  chat_id: i64,
  text: &'a str,
  parse_mode: &'static str,
}

/// Telegram Bot API client.
pub struct TelegramSender {
  client: reqwest::Client,
  endpoint: String,
}

impl TelegramSender {
  pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self, SendError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      endpoint: format!("{}/bot{}/sendMessage", api_url.trim_end_matches('/'), token),
    })
  }
}

#[async_trait]
impl MessageSender for TelegramSender {
  async fn send_message(&self, user_id: i64, text: &str) -> Result<(), SendError> {
    let response = self
      .client
      .post(&self.endpoint)
      .json(&SendMessage {
        chat_id: user_id,
        text,
        parse_mode: "Markdown",
      })
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(SendError::Refused(format!("{}: {}", status, body)));
    }
    debug!(user_id, "message sent");
    Ok(())
  }
}

/// Writes messages to the log instead of a chat. Used when no token is
/// configured.
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
  async fn send_message(&self, user_id: i64, text: &str) -> Result<(), SendError> {
    info!(user_id, text, "outgoing message");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::{extract::State, routing::post, Json, Router};
  use std::sync::{Arc, Mutex};
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_telegram_send_message_payload() {
    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
    let app = Router::new()
      .route(
        "/botTOKEN/sendMessage",
        post(
          |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
           Json(body): Json<serde_json::Value>| async move {
            seen.lock().unwrap().push(body);
            Json(serde_json::json!({"ok": true}))
          },
        ),
      )
      .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    let sender =
      TelegramSender::new(&format!("http://{}/", addr), "TOKEN", Duration::from_secs(5)).unwrap();
    sender.send_message(42, "*Report:* empty").await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0]["chat_id"], 42);
    assert_eq!(seen[0]["text"], "*Report:* empty");
    assert_eq!(seen[0]["parse_mode"], "Markdown");
  }

  #[tokio::test]
  async fn test_unreachable_api_is_an_error() {
    let sender =
      TelegramSender::new("http://127.0.0.1:9", "TOKEN", Duration::from_millis(500)).unwrap();
    assert!(sender.send_message(1, "hi").await.is_err());
  }
}
