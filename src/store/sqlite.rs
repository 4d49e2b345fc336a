//! SQLite-backed [`Store`].

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{Category, CategorySum, Report, Store, StoreError, BASE_CURRENCY};

/// SQLite store. One connection behind a mutex; multi-step writes run in a
/// single transaction.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (user_id, name)
);

-- amount is a decimal string in the base currency, date is fixed-width RFC 3339
CREATE TABLE IF NOT EXISTS spendings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    category_id INTEGER NOT NULL REFERENCES categories(id),
    amount TEXT NOT NULL,
    date TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_spendings_user_date ON spendings(user_id, date);

CREATE TABLE IF NOT EXISTS currencies (
    user_id INTEGER PRIMARY KEY,
    char_code TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS limits (
    user_id INTEGER PRIMARY KEY,
    amount TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
    // Bot and worker processes share the file.
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    Self::with_connection(conn)
  }

  /// Private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Corrupt(format!("lock poisoned: {}", e)))
  }
}

fn to_sql_time(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_sql_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad date '{}': {}", s, e)))
}

fn parse_amount(s: &str) -> Result<Decimal, StoreError> {
  Decimal::from_str(s).map_err(|e| StoreError::Corrupt(format!("bad amount '{}': {}", s, e)))
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
  now
    .date_naive()
    .with_day(1)
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
    .unwrap_or(now)
}

impl Store for SqliteStore {
  fn active_currency(&self, user_id: i64) -> Result<String, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let code: Option<String> = tx
      .query_row(
        "SELECT char_code FROM currencies WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
      )
      .optional()?;

    let code = match code {
      Some(code) => code,
      None => {
        tx.execute(
          "INSERT INTO currencies (user_id, char_code) VALUES (?, ?)",
          params![user_id, BASE_CURRENCY],
        )?;
        BASE_CURRENCY.to_string()
      }
    };
    tx.commit()?;
    Ok(code)
  }

  fn set_active_currency(&self, user_id: i64, code: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO currencies (user_id, char_code) VALUES (?1, ?2)
       ON CONFLICT (user_id) DO UPDATE SET char_code = ?2, updated_at = datetime('now')",
      params![user_id, code],
    )?;
    Ok(())
  }

  fn report_period(
    &self,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Report, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT c.name, s.amount, s.date FROM spendings s
       INNER JOIN categories c ON c.id = s.category_id
       WHERE s.user_id = ? AND s.date BETWEEN ? AND ?",
    )?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map(params![user_id, to_sql_time(start), to_sql_time(end)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })?
      .collect::<Result<_, _>>()?;

    // BTreeMap keeps categories ordered by name.
    let mut totals: BTreeMap<String, (Decimal, DateTime<Utc>)> = BTreeMap::new();
    for (name, amount, date) in rows {
      let amount = parse_amount(&amount)?;
      let date = from_sql_time(&date)?;
      let entry = totals.entry(name).or_insert((Decimal::ZERO, date));
      entry.0 += amount;
      if date < entry.1 {
        entry.1 = date;
      }
    }

    let mut min_date = Utc::now();
    let mut by_category = Vec::with_capacity(totals.len());
    for (category, (sum, first)) in totals {
      if sum <= Decimal::ZERO {
        continue;
      }
      if first < min_date {
        min_date = first;
      }
      by_category.push(CategorySum { category, sum });
    }

    Ok(Report {
      by_category,
      min_date,
    })
  }

  fn create_spending(
    &self,
    user_id: i64,
    category: &str,
    amount: Decimal,
    date: DateTime<Utc>,
  ) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT OR IGNORE INTO categories (user_id, name) VALUES (?, ?)",
      params![user_id, category],
    )?;
    let category_id: i64 = tx.query_row(
      "SELECT id FROM categories WHERE user_id = ? AND name = ?",
      params![user_id, category],
      |row| row.get(0),
    )?;

    let limit: Option<String> = tx
      .query_row(
        "SELECT amount FROM limits WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
      )
      .optional()?;

    if let Some(limit) = limit {
      let limit = parse_amount(&limit)?;
      let now = Utc::now();
      let mut stmt = tx.prepare(
        "SELECT amount FROM spendings WHERE user_id = ? AND date BETWEEN ? AND ?",
      )?;
      let amounts: Vec<String> = stmt
        .query_map(
          params![user_id, to_sql_time(start_of_month(now)), to_sql_time(now)],
          |row| row.get(0),
        )?
        .collect::<Result<_, _>>()?;
      drop(stmt);

      let mut spent = Decimal::ZERO;
      for a in &amounts {
        spent += parse_amount(a)?;
      }
      if spent + amount > limit {
        debug!(user_id, %spent, %amount, %limit, "month limit exceeded");
        // Dropping the transaction rolls back the category insert too.
        return Err(StoreError::LimitExceeded);
      }
    }

    tx.execute(
      "INSERT INTO spendings (user_id, category_id, amount, date) VALUES (?, ?, ?, ?)",
      params![user_id, category_id, amount.to_string(), to_sql_time(date)],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn create_category(&self, user_id: i64, name: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let inserted = conn.execute(
      "INSERT OR IGNORE INTO categories (user_id, name) VALUES (?, ?)",
      params![user_id, name],
    )?;
    if inserted == 0 {
      return Err(StoreError::CategoryExists);
    }
    Ok(())
  }

  fn categories(&self, user_id: i64) -> Result<Vec<Category>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM categories WHERE user_id = ? ORDER BY id")?;
    let categories = stmt
      .query_map(params![user_id], |row| Ok(Category { name: row.get(0)? }))?
      .collect::<Result<_, _>>()?;
    Ok(categories)
  }

  fn limit(&self, user_id: i64) -> Result<Decimal, StoreError> {
    let conn = self.lock()?;
    let amount: Option<String> = conn
      .query_row(
        "SELECT amount FROM limits WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
      )
      .optional()?;
    match amount {
      Some(amount) => parse_amount(&amount),
      None => Err(StoreError::LimitNotSet),
    }
  }

  fn set_limit(&self, user_id: i64, amount: Decimal) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO limits (user_id, amount) VALUES (?1, ?2)
       ON CONFLICT (user_id) DO UPDATE SET amount = ?2, updated_at = datetime('now')",
      params![user_id, amount.to_string()],
    )?;
    Ok(())
  }

  fn drop_limit(&self, user_id: i64) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM limits WHERE user_id = ?", params![user_id])?;
    Ok(())
  }
}
