//! Chat command handling.

mod commands;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::{CacheOrchestrator, ReportLookup};
use crate::error::ServiceError;
use crate::messenger::MessageSender;
use crate::period::Period;
use crate::rates::{currency_name, RateError, RateSource};
use crate::report::ReportResult;
use crate::store::{Report, StoreError};

use commands::CommandKind;

pub const REPORT_PENDING: &str = "Report is being prepared, it will arrive shortly";
const HELLO: &str = "Hello! I can help you manage your spendings.";

/// An inbound chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
  pub user_id: i64,
  pub text: String,
}

/// Turns chat messages into store and cache operations and replies.
pub struct Model {
  cache: Arc<CacheOrchestrator>,
  rates: Arc<dyn RateSource>,
  sender: Arc<dyn MessageSender>,
}

impl Model {
  pub fn new(
    cache: Arc<CacheOrchestrator>,
    rates: Arc<dyn RateSource>,
    sender: Arc<dyn MessageSender>,
  ) -> Self {
    Self {
      cache,
      rates,
      sender,
    }
  }

  pub fn cache(&self) -> &Arc<CacheOrchestrator> {
    &self.cache
  }

  /// Handle a message and send the reply.
  pub async fn incoming_message(&self, msg: &Message) -> Result<(), ServiceError> {
    let reply = self.reply(msg).await;
    self.sender.send_message(msg.user_id, &reply).await?;
    Ok(())
  }

  /// The reply text for `msg`. Failures are logged and replaced with the
  /// matching user-facing error.
  pub async fn reply(&self, msg: &Message) -> String {
    let word = msg.text.split_whitespace().next().unwrap_or_default();
    let Some(command) = commands::resolve(word) else {
      debug!(user_id = msg.user_id, word, "unknown command");
      return unknown_command(word);
    };

    match self.proceed(command.kind, msg).await {
      Ok(reply) => reply,
      Err(e) => {
        error!(user_id = msg.user_id, command = command.name, "Command failed: {}", e);
        e.user_message().to_string()
      }
    }
  }

  async fn proceed(&self, kind: CommandKind, msg: &Message) -> Result<String, ServiceError> {
    let args: Vec<&str> = msg.text.split_whitespace().skip(1).collect();
    let user_id = msg.user_id;

    match kind {
      CommandKind::Start => Ok(format!("{}\n\n{}", HELLO, commands::help_text())),
      CommandKind::AddExpense => self.add_expense(user_id, &args),
      CommandKind::NewCategory => self.new_category(user_id, &args),
      CommandKind::ListCategories => self.list_categories(user_id),
      CommandKind::ReportWeek => self.report(user_id, Period::Week).await,
      CommandKind::ReportMonth => self.report(user_id, Period::Month).await,
      CommandKind::ReportYear => self.report(user_id, Period::Year).await,
      CommandKind::CurrencyAll => Ok(self.currency_list()),
      CommandKind::CurrencyGet => self.active_currency(user_id),
      CommandKind::CurrencySet => self.set_currency(user_id, &args),
      CommandKind::LimitGet => self.limit(user_id),
      CommandKind::LimitSet => self.set_limit(user_id, &args),
    }
  }

  /// Active currency code and its rate.
  fn currency(&self, user_id: i64) -> Result<(String, Decimal), ServiceError> {
    let lookup = self.cache.active_currency(user_id)?;
    debug!(user_id, cached = lookup.is_hit(), "active currency");
    let code = lookup.data;
    let rate = self.rates.rate(&code)?;
    Ok((code, rate))
  }

  fn add_expense(&self, user_id: i64, args: &[&str]) -> Result<String, ServiceError> {
    let Some((category, amount, date)) = parse_expense(args) else {
      return Ok("Usage: /addexp <category name> <amount> [dd/mm/yy]".to_string());
    };
    if amount <= Decimal::ZERO {
      return Ok("Unknown amount".to_string());
    }

    let (_, rate) = self.currency(user_id)?;
    let amount = amount * rate;

    match self
      .cache
      .store()
      .create_spending(user_id, &category, amount, date)
    {
      Ok(()) => {}
      Err(StoreError::LimitExceeded) => return Ok("Limit exceeded".to_string()),
      Err(e) => return Err(e.into()),
    }

    let invalidated = self.cache.invalidate_on_new_spending(user_id, date);
    info!(user_id, %category, ?invalidated, "expense added");
    Ok("Expense added".to_string())
  }

  fn new_category(&self, user_id: i64, args: &[&str]) -> Result<String, ServiceError> {
    let name = args.join(" ");
    if name.is_empty() {
      return Ok("Category name must not be empty".to_string());
    }
    match self.cache.store().create_category(user_id, &name) {
      Ok(()) => Ok(format!("Category '{}' added", name)),
      Err(StoreError::CategoryExists) => Ok(format!("Category '{}' already exists", name)),
      Err(e) => Err(e.into()),
    }
  }

  fn list_categories(&self, user_id: i64) -> Result<String, ServiceError> {
    let categories = self.cache.store().categories(user_id)?;
    let names: Vec<String> = categories.into_iter().map(|c| c.name).collect();
    Ok(listing("*Categories:*", &names))
  }

  async fn report(&self, user_id: i64, period: Period) -> Result<String, ServiceError> {
    let (start, end) = period.window(Utc::now());
    match self.cache.report(user_id, period, start, end).await? {
      ReportLookup::Ready(report) => self.report_message(user_id, &report),
      ReportLookup::Pending => Ok(REPORT_PENDING.to_string()),
    }
  }

  /// Render a report in the user's active currency.
  pub fn report_message(&self, user_id: i64, report: &Report) -> Result<String, ServiceError> {
    let (code, rate) = self.currency(user_id)?;
    let mut lines = Vec::with_capacity(report.by_category.len());
    for row in &report.by_category {
      let sum = row
        .sum
        .checked_div(rate)
        .ok_or_else(|| RateError::NotSupported(code.clone()))?;
      lines.push(format!("{}: {:.2} {}", row.category, sum.round_dp(2), code));
    }
    Ok(listing("*Report:*", &lines))
  }

  /// Format a worker's result and send it to its user.
  pub async fn deliver_report(&self, result: &ReportResult) -> Result<(), ServiceError> {
    let text = self.report_message(result.user_id, &result.report)?;
    self.sender.send_message(result.user_id, &text).await?;
    info!(user_id = result.user_id, period = %result.period, "report sent");
    Ok(())
  }

  fn currency_list(&self) -> String {
    let lines: Vec<String> = self
      .rates
      .all()
      .into_iter()
      .map(|(code, rate)| describe_currency(&code, rate))
      .collect();
    listing("*Currency List:*", &lines)
  }

  fn active_currency(&self, user_id: i64) -> Result<String, ServiceError> {
    let (code, rate) = self.currency(user_id)?;
    Ok(format!("*Active Currency:*\n{}", describe_currency(&code, rate)))
  }

  fn set_currency(&self, user_id: i64, args: &[&str]) -> Result<String, ServiceError> {
    let Some(code) = args.first().map(|c| c.to_uppercase()) else {
      return Ok("Active currency not set".to_string());
    };
    if let Err(RateError::NotSupported(_)) = self.rates.rate(&code) {
      return Ok("Unknown currency".to_string());
    }
    self.cache.set_active_currency(user_id, &code)?;
    info!(user_id, %code, "active currency changed");
    self.active_currency(user_id)
  }

  fn limit(&self, user_id: i64) -> Result<String, ServiceError> {
    let limit = match self.cache.store().limit(user_id) {
      Ok(limit) => limit,
      Err(StoreError::LimitNotSet) => return Ok("*Month limit:* not set".to_string()),
      Err(e) => return Err(e.into()),
    };
    let (code, rate) = self.currency(user_id)?;
    let limit = limit
      .checked_div(rate)
      .ok_or_else(|| RateError::NotSupported(code.clone()))?;
    Ok(format!("*Month limit:* {:.2} {}", limit.round_dp(2), code))
  }

  fn set_limit(&self, user_id: i64, args: &[&str]) -> Result<String, ServiceError> {
    match args.first() {
      None => self.cache.store().drop_limit(user_id)?,
      Some(raw) => {
        let amount = match Decimal::from_str(raw) {
          Ok(amount) if amount >= Decimal::ZERO => amount,
          _ => return Ok("Unknown amount".to_string()),
        };
        let (_, rate) = self.currency(user_id)?;
        self.cache.store().set_limit(user_id, amount * rate)?;
      }
    }
    self.limit(user_id)
  }
}

/// `header` followed by one item per line, or ` empty`.
fn listing(header: &str, items: &[String]) -> String {
  if items.is_empty() {
    format!("{} empty", header)
  } else {
    format!("{}\n{}", header, items.join("\n"))
  }
}

fn describe_currency(code: &str, rate: Decimal) -> String {
  match currency_name(code) {
    Some(name) => format!("{} {} _{}_", code, rate, name),
    None => format!("{} {}", code, rate),
  }
}

fn unknown_command(word: &str) -> String {
  let suggestions = commands::get_suggestions(word);
  if word.is_empty() || suggestions.is_empty() || suggestions.len() == commands::COMMANDS.len() {
    return "I don't know this command, try /start".to_string();
  }
  let names: Vec<String> = suggestions
    .iter()
    .map(|cmd| format!("/{}", cmd.name))
    .collect();
  format!("I don't know this command. Did you mean {}?", names.join(", "))
}

/// Split `<category words...> <amount> [dd/mm/yy]`. Without a date the
/// spending is dated now.
fn parse_expense(args: &[&str]) -> Option<(String, Decimal, DateTime<Utc>)> {
  let (rest, date) = match args.split_last() {
    Some((last, rest)) => match NaiveDate::parse_from_str(last, "%d/%m/%y") {
      Ok(day) => (rest, day.and_hms_opt(0, 0, 0)?.and_utc()),
      Err(_) => (args, Utc::now()),
    },
    None => return None,
  };

  let (amount, category) = rest.split_last()?;
  let amount = Decimal::from_str(amount).ok()?;
  let category = category.join(" ");
  if category.is_empty() {
    return None;
  }
  Some((category, amount, date))
}
