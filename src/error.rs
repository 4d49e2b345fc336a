//! User-facing error union.

use thiserror::Error;

use crate::messenger::SendError;
use crate::rates::RateError;
use crate::report::DispatchError;
use crate::store::StoreError;

pub const SERVICE_ERROR: &str = "Service error, try again later";
pub const CURRENCY_ERROR: &str = "Currency service error, try again later";

/// Any failure that reaches the chat formatter.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error("report dispatch failed: {0}")]
  Dispatch(#[from] DispatchError),
  #[error(transparent)]
  Rates(#[from] RateError),
  #[error(transparent)]
  Send(#[from] SendError),
}

impl ServiceError {
  /// The text shown to the user. Internals never leak past this point.
  pub fn user_message(&self) -> &'static str {
    match self {
      ServiceError::Rates(_) => CURRENCY_ERROR,
      _ => SERVICE_ERROR,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_user_messages() {
    let err = ServiceError::from(StoreError::Corrupt("disk".to_string()));
    assert_eq!(err.user_message(), SERVICE_ERROR);

    let err = ServiceError::from(DispatchError::AckTimeout);
    assert_eq!(err.user_message(), SERVICE_ERROR);

    let err = ServiceError::from(RateError::NotSupported("XYZ".to_string()));
    assert_eq!(err.user_message(), CURRENCY_ERROR);
  }
}
