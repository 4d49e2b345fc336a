//! Exchange rates against the base currency.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::BASE_CURRENCY;

#[derive(Debug, Error)]
pub enum RateError {
  #[error("currency {0} not supported")]
  NotSupported(String),
  #[error("failed to fetch rates: {0}")]
  Fetch(#[from] reqwest::Error),
  #[error("failed to parse rates: {0}")]
  Parse(String),
}

/// Price of one unit of a currency in [`BASE_CURRENCY`].
pub trait RateSource: Send + Sync {
  fn rate(&self, code: &str) -> Result<Decimal, RateError>;

  /// Every known rate, sorted by code.
  fn all(&self) -> Vec<(String, Decimal)>;
}

#[derive(Debug, Deserialize)]
struct DailyFeed {
  #[serde(rename = "Valute")]
  valute: HashMap<String, FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
  #[serde(rename = "CharCode")]
  char_code: String,
  #[serde(rename = "Nominal")]
  nominal: serde_json::Number,
  #[serde(rename = "Value")]
  value: serde_json::Number,
}

fn number(n: &serde_json::Number) -> Option<Decimal> {
  let s = n.to_string();
  Decimal::from_str(&s)
    .or_else(|_| Decimal::from_scientific(&s))
    .ok()
}

/// Parse the central bank's daily JSON feed into per-unit rates.
/// Entries with unreadable numbers or a zero nominal are skipped.
fn parse_feed(body: &[u8]) -> Result<HashMap<String, Decimal>, RateError> {
  let feed: DailyFeed =
    serde_json::from_slice(body).map_err(|e| RateError::Parse(e.to_string()))?;

  let mut rates = HashMap::with_capacity(feed.valute.len());
  for entry in feed.valute.into_values() {
    let (Some(value), Some(nominal)) = (number(&entry.value), number(&entry.nominal)) else {
      debug!(code = %entry.char_code, "skipping unreadable rate");
      continue;
    };
    let Some(rate) = value.checked_div(nominal) else {
      continue;
    };
    rates.insert(entry.char_code, rate.normalize());
  }
  Ok(rates)
}

/// Rates from the Central Bank of Russia daily feed, refreshed in the
/// background. The base currency is always present with rate 1.
pub struct CbrRates {
  client: reqwest::Client,
  url: String,
  rates: RwLock<HashMap<String, Decimal>>,
}

impl CbrRates {
  pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RateError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let mut rates = HashMap::new();
    rates.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
    Ok(Self {
      client,
      url: url.into(),
      rates: RwLock::new(rates),
    })
  }

  /// Fetch the feed and merge it into the table. Returns the number of
  /// rates read. On failure the previous table is kept.
  pub async fn refresh(&self) -> Result<usize, RateError> {
    let body = self
      .client
      .get(&self.url)
      .send()
      .await?
      .error_for_status()?
      .bytes()
      .await?;
    let fresh = parse_feed(&body)?;
    let count = fresh.len();

    let mut rates = self.rates.write().unwrap_or_else(|e| e.into_inner());
    rates.extend(fresh);
    rates.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
    Ok(count)
  }

  /// Refresh every `interval` until `cancel` fires.
  pub fn spawn_refresher(
    self: Arc<Self>,
    interval: Duration,
    cancel: CancellationToken,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => match self.refresh().await {
            Ok(count) => info!(count, "currencies updated"),
            Err(e) => warn!("Currency refresh failed, keeping previous rates: {}", e),
          },
        }
      }
      debug!("rate refresher stopped");
    })
  }

  #[cfg(test)]
  pub(crate) fn insert(&self, code: &str, rate: Decimal) {
    self
      .rates
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(code.to_string(), rate);
  }
}

impl RateSource for CbrRates {
  fn rate(&self, code: &str) -> Result<Decimal, RateError> {
    self
      .rates
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(code)
      .copied()
      .ok_or_else(|| RateError::NotSupported(code.to_string()))
  }

  fn all(&self) -> Vec<(String, Decimal)> {
    let rates = self.rates.read().unwrap_or_else(|e| e.into_inner());
    let mut all: Vec<_> = rates.iter().map(|(k, v)| (k.clone(), *v)).collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all
  }
}

/// Display name of a currency code, if known.
pub fn currency_name(code: &str) -> Option<&'static str> {
  let name = match code {
    "AUD" => "Australian dollar",
    "AZN" => "Azerbaijani manat",
    "GBP" => "Pound sterling",
    "AMD" => "Armenian dram",
    "BYN" => "Belarusian ruble",
    "BGN" => "Bulgarian lev",
    "BRL" => "Brazilian real",
    "HUF" => "Hungarian forint",
    "HKD" => "Hong Kong dollar",
    "DKK" => "Danish krone",
    "USD" => "US dollar",
    "EUR" => "Euro",
    "INR" => "Indian rupee",
    "KZT" => "Kazakhstani tenge",
    "CAD" => "Canadian dollar",
    "KGS" => "Kyrgyzstani som",
    "CNY" => "Chinese yuan",
    "MDL" => "Moldovan leu",
    "NOK" => "Norwegian krone",
    "PLN" => "Polish zloty",
    "RON" => "Romanian leu",
    "RUB" => "Russian ruble",
    "XDR" => "Special drawing rights",
    "SGD" => "Singapore dollar",
    "TJS" => "Tajikistani somoni",
    "TRY" => "Turkish lira",
    "TMT" => "Turkmenistan manat",
    "UZS" => "Uzbekistani som",
    "UAH" => "Ukrainian hryvnia",
    "CZK" => "Czech koruna",
    "SEK" => "Swedish krona",
    "CHF" => "Swiss franc",
    "ZAR" => "South African rand",
    "KRW" => "South Korean won",
    "JPY" => "Japanese yen",
    _ => return None,
  };
  Some(name)
}
