//! Validation errors raised by the billing and ledger calculations.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;

/// A request that can never be applied to the ledger as given.
///
/// These are raised before any write and leave every record unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Bag count must be positive (got {0})")]
    NonPositiveBags(i64),

    #[error("Cannot withdraw {requested} bags: only {available} bags stored")]
    ExceedsStoredBalance { requested: i64, available: i64 },

    #[error("Cannot increase withdrawal by {additional} bags: only {available} bags stored")]
    RevisionExceedsBalance { additional: i64, available: i64 },

    #[error("Withdrawal date {date} is before storage start date {start}")]
    BeforeStorageStart { date: NaiveDate, start: NaiveDate },

    #[error("Withdrawal date {date} is in the future (today is {today})")]
    FutureDate { date: NaiveDate, today: NaiveDate },

    #[error("Payment amount must be positive (got {0})")]
    NonPositiveAmount(Decimal),

    #[error("{field} cannot be negative (got {value})")]
    NegativeAmount { field: &'static str, value: Decimal },
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}
