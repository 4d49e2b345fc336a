//! Rolling report periods.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A rolling report window ending "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
  #[serde(rename = "W")]
  Week,
  #[serde(rename = "M")]
  Month,
  #[serde(rename = "Y")]
  Year,
}

impl Period {
  /// Widest first, so invalidation walks Year, Month, Week.
  pub const ALL: [Period; 3] = [Period::Year, Period::Month, Period::Week];

  /// Short tag used in cache keys and on the wire.
  pub fn tag(self) -> &'static str {
    match self {
      Period::Week => "W",
      Period::Month => "M",
      Period::Year => "Y",
    }
  }

  /// Start of this period's window when it ends at `now`.
  ///
  /// Calendar months and years are used, so a month back from March 31st
  /// lands on the last day of February.
  pub fn start_before(self, now: DateTime<Utc>) -> DateTime<Utc> {
    match self {
      Period::Week => now - Duration::days(7),
      Period::Month => now
        .checked_sub_months(Months::new(1))
        .unwrap_or(now - Duration::days(31)),
      Period::Year => now
        .checked_sub_months(Months::new(12))
        .unwrap_or(now - Duration::days(366)),
    }
  }

  /// The `(start, end)` window for a report requested at `now`.
  pub fn window(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (self.start_before(now), now)
  }
}

impl fmt::Display for Period {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Period::Week => "week",
      Period::Month => "month",
      Period::Year => "year",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_month_window_clamps_to_month_end() {
    let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
    let (start, end) = Period::Month.window(now);
    assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
    assert_eq!(end, now);
  }

  #[test]
  fn test_week_and_year_windows() {
    let now = Utc.with_ymd_and_hms(2024, 6, 15, 8, 30, 0).unwrap();
    assert_eq!(
      Period::Week.start_before(now),
      Utc.with_ymd_and_hms(2024, 6, 8, 8, 30, 0).unwrap()
    );
    assert_eq!(
      Period::Year.start_before(now),
      Utc.with_ymd_and_hms(2023, 6, 15, 8, 30, 0).unwrap()
    );
  }

  #[test]
  fn test_wire_tags() {
    assert_eq!(serde_json::to_string(&Period::Year).unwrap(), "\"Y\"");
    assert_eq!(serde_json::from_str::<Period>("\"M\"").unwrap(), Period::Month);
    assert!(serde_json::from_str::<Period>("\"D\"").is_err());
    for period in Period::ALL {
      assert_eq!(serde_json::to_string(&period).unwrap(), format!("\"{}\"", period.tag()));
    }
  }
}
