use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub database: DatabaseConfig,
  pub broker: BrokerConfig,
  pub server: ServerConfig,
  pub worker: WorkerConfig,
  pub rates: RatesConfig,
  pub telegram: TelegramConfig,
  /// Mirror logs into daily files under this directory
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub currency_capacity: NonZeroUsize,
  pub report_capacity: NonZeroUsize,
  /// Keep reports delivered by workers for later reads
  pub populate_reports_on_delivery: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      currency_capacity: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
      report_capacity: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
      populate_reports_on_delivery: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  pub path: PathBuf,
}

impl Default for DatabaseConfig {
  fn default() -> Self {
    Self {
      path: data_dir().join("spendbot.db"),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  pub path: PathBuf,
  pub topic: String,
  pub consumer_group: String,
  /// Messages the producer buffers before senders have to wait
  pub send_buffer: usize,
  pub enqueue_timeout_ms: u64,
  pub ack_timeout_ms: u64,
  pub lease_secs: u64,
  pub max_deliveries: u32,
  pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      path: data_dir().join("broker.db"),
      topic: "report-requests".to_string(),
      consumer_group: "report-requests-group".to_string(),
      send_buffer: 256,
      enqueue_timeout_ms: 5000,
      ack_timeout_ms: 5000,
      lease_secs: 30,
      max_deliveries: 5,
      poll_interval_ms: 500,
    }
  }
}

impl BrokerConfig {
  pub fn enqueue_timeout(&self) -> Duration {
    Duration::from_millis(self.enqueue_timeout_ms)
  }

  pub fn ack_timeout(&self) -> Duration {
    Duration::from_millis(self.ack_timeout_ms)
  }

  pub fn lease(&self) -> Duration {
    Duration::from_secs(self.lease_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub listen: String,
  /// Base URL workers post results to
  pub public_url: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:5000".to_string(),
      public_url: "http://127.0.0.1:5000".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub concurrency: usize,
  pub delivery_timeout_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: 4,
      delivery_timeout_ms: 1000,
    }
  }
}

impl WorkerConfig {
  pub fn delivery_timeout(&self) -> Duration {
    Duration::from_millis(self.delivery_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
  pub url: String,
  pub refresh_secs: u64,
}

impl Default for RatesConfig {
  fn default() -> Self {
    Self {
      url: "https://www.cbr-xml-daily.ru/daily_json.js".to_string(),
      refresh_secs: 3600,
    }
  }
}

impl RatesConfig {
  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
  pub api_url: String,
}

impl Default for TelegramConfig {
  fn default() -> Self {
    Self {
      api_url: "https://api.telegram.org".to_string(),
    }
  }
}

fn data_dir() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("spendbot")
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spendbot.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spendbot/config.yaml
  ///
  /// Every setting has a default, so running without a file is fine.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("spendbot.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("spendbot").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Telegram bot token from the environment.
  ///
  /// Checks SPENDBOT_TELEGRAM_TOKEN first, then TELEGRAM_BOT_TOKEN.
  pub fn telegram_token() -> Option<String> {
    std::env::var("SPENDBOT_TELEGRAM_TOKEN")
      .or_else(|_| std::env::var("TELEGRAM_BOT_TOKEN"))
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
