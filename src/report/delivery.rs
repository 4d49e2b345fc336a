use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::ReportResult;

#[derive(Debug, Error)]
pub enum DeliveryError {
  #[error("invalid delivery url: {0}")]
  Url(#[from] url::ParseError),
  #[error("delivery request failed: {0}")]
  Http(#[from] reqwest::Error),
  #[error("origin rejected report with status {0}")]
  Rejected(reqwest::StatusCode),
}

/// Hands a finished report back to the service that asked for it.
#[async_trait]
pub trait ReportDelivery: Send + Sync {
  async fn deliver(&self, result: &ReportResult) -> Result<(), DeliveryError>;
}

/// Posts results as JSON to `{base}/reports`.
pub struct HttpDelivery {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpDelivery {
  /// `timeout` bounds each call end to end.
  pub fn new(base: &str, timeout: Duration) -> Result<Self, DeliveryError> {
    let mut base = Url::parse(base)?;
    // Url::join replaces the last segment unless the path ends with '/'.
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    let endpoint = base.join("reports")?;
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, endpoint })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }
}

#[async_trait]
impl ReportDelivery for HttpDelivery {
  async fn deliver(&self, result: &ReportResult) -> Result<(), DeliveryError> {
    let response = self
      .client
      .post(self.endpoint.clone())
      .json(result)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(DeliveryError::Rejected(status));
    }
    debug!(user_id = result.user_id, period = %result.period, "report delivered");
    Ok(())
  }
}
