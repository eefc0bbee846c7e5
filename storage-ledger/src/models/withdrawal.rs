//! Withdrawal transaction model: the audit row of one outflow.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Withdrawal transaction.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WithdrawalTransaction {
    pub transaction_id: Uuid,
    pub warehouse_id: Uuid,
    pub record_id: Uuid,
    pub bags_withdrawn: i64,
    pub rent_collected: Decimal,
    pub withdrawal_date: NaiveDate,
    pub invoice_number: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl WithdrawalTransaction {
    /// Check if the withdrawal has been reversed.
    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }
}

/// Input for inserting a withdrawal transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWithdrawalTransaction {
    pub transaction_id: Uuid,
    pub record_id: Uuid,
    pub bags_withdrawn: i64,
    pub rent_collected: Decimal,
    pub withdrawal_date: NaiveDate,
    pub invoice_number: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Corrected values for an existing withdrawal transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalTransactionUpdate {
    pub bags_withdrawn: i64,
    pub rent_collected: Decimal,
    pub withdrawal_date: NaiveDate,
}
