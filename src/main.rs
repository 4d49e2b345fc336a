mod bot;
mod broker;
mod cache;
mod config;
mod error;
mod messenger;
mod period;
mod rates;
mod report;
mod server;
mod store;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use broker::{Producer, SqliteLog};
use cache::{CacheOrchestrator, LruCache};
use config::Config;
use messenger::{LogSender, MessageSender, TelegramSender};
use rates::CbrRates;
use report::{DispatchTimeouts, HttpDelivery, ReportDispatcher, ReportWorker, WorkerOptions};
use store::{SqliteStore, BASE_CURRENCY};

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "spendbot")]
#[command(about = "Spending tracker chat bot with asynchronous reports")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spendbot/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Answer chat messages and receive computed reports
  Bot,
  /// Compute requested reports and post them back to the bot
  Worker {
    /// Number of concurrent consumers (overrides worker.concurrency)
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(config.log_dir.as_deref())?;

  let shutdown = CancellationToken::new();
  let signal = shutdown.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        info!("shutting down");
        signal.cancel();
      }
      Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
    }
  });

  match args.command {
    Command::Bot => run_bot(config, shutdown).await,
    Command::Worker { concurrency } => run_worker(config, concurrency, shutdown).await,
  }
}

/// Logs go to stderr and, when `log_dir` is set, to a daily file as well.
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_filter(filter());

  let Some(dir) = log_dir else {
    tracing_subscriber::registry()
      .with(stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  };

  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    dir,
    "spendbot.log",
  ));
  let file = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_filter(filter());
  tracing_subscriber::registry()
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
  Ok(Some(guard))
}

fn open_log(config: &Config) -> Result<Arc<SqliteLog>> {
  let log = SqliteLog::open(&config.broker.path)?.with_max_deliveries(config.broker.max_deliveries);
  Ok(Arc::new(log))
}

async fn run_bot(config: Config, shutdown: CancellationToken) -> Result<()> {
  let store = Arc::new(SqliteStore::open(&config.database.path)?);

  let (producer, producer_task) =
    Producer::spawn(open_log(&config)?, config.broker.send_buffer, shutdown.clone());
  let dispatcher = Arc::new(ReportDispatcher::new(
    producer,
    config.broker.topic.clone(),
    DispatchTimeouts {
      enqueue: config.broker.enqueue_timeout(),
      ack: config.broker.ack_timeout(),
    },
    shutdown.clone(),
  ));

  let currencies = LruCache::new("currency", config.cache.currency_capacity);
  let reports = LruCache::new("report", config.cache.report_capacity);
  info!(
    currency_capacity = currencies.capacity(),
    report_capacity = reports.capacity(),
    "caches ready"
  );
  let cache = Arc::new(CacheOrchestrator::new(
    store,
    currencies,
    reports,
    dispatcher,
  ));

  let rates = Arc::new(
    CbrRates::new(config.rates.url.clone(), HTTP_CLIENT_TIMEOUT)
      .map_err(|e| eyre!("Failed to create rate client: {}", e))?,
  );
  match rates.refresh().await {
    Ok(count) => info!(count, "currencies loaded"),
    Err(e) => warn!("Initial currency fetch failed, only {} is available: {}", BASE_CURRENCY, e),
  }
  let refresher = rates
    .clone()
    .spawn_refresher(config.rates.refresh_interval(), shutdown.clone());

  let sender: Arc<dyn MessageSender> = match Config::telegram_token() {
    Some(token) => Arc::new(
      TelegramSender::new(&config.telegram.api_url, &token, HTTP_CLIENT_TIMEOUT)
        .map_err(|e| eyre!("Failed to create Telegram client: {}", e))?,
    ),
    None => {
      warn!("No Telegram token set, replies are written to the log");
      Arc::new(LogSender)
    }
  };

  let model = Arc::new(bot::Model::new(cache, rates, sender));
  let listener = TcpListener::bind(&config.server.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.server.listen, e))?;
  let state = server::AppState {
    model,
    populate_reports: config.cache.populate_reports_on_delivery,
  };
  let served = server::serve(listener, state, shutdown.clone()).await;

  shutdown.cancel();
  let (producer_done, refresher_done) = futures::future::join(producer_task, refresher).await;
  for done in [producer_done, refresher_done] {
    if let Err(e) = done {
      error!("Background task failed: {}", e);
    }
  }
  served.map_err(|e| eyre!("HTTP server failed: {}", e))
}

async fn run_worker(
  config: Config,
  concurrency: Option<usize>,
  shutdown: CancellationToken,
) -> Result<()> {
  let store = Arc::new(SqliteStore::open(&config.database.path)?);
  let delivery = Arc::new(
    HttpDelivery::new(&config.server.public_url, config.worker.delivery_timeout())
      .map_err(|e| eyre!("Failed to create delivery client: {}", e))?,
  );
  let delivery_endpoint = delivery.endpoint().clone();
  let log = open_log(&config)?;
  let parked = log
    .dead_letters(&config.broker.consumer_group)
    .map_err(|e| eyre!("Failed to read dead letters: {}", e))?
    .len();
  if parked > 0 {
    warn!(parked, "report requests parked after repeated failures");
  }

  let worker = Arc::new(ReportWorker::new(
    log,
    store,
    delivery,
    WorkerOptions {
      topic: config.broker.topic.clone(),
      group: config.broker.consumer_group.clone(),
      lease: config.broker.lease(),
      poll_interval: config.broker.poll_interval(),
    },
  ));

  let concurrency = concurrency.unwrap_or(config.worker.concurrency);
  info!(
    concurrency,
    endpoint = %delivery_endpoint,
    topic = %config.broker.topic,
    group = %config.broker.consumer_group,
    "report workers started"
  );
  let handles = worker.spawn_pool(concurrency, shutdown);
  for done in futures::future::join_all(handles).await {
    if let Err(e) = done {
      error!("Report worker failed: {}", e);
    }
  }
  info!("report workers stopped");
  Ok(())
}
