//! Storage record model: one deposit of bags by one customer.

use super::payment::Payment;
use super::pricing::Pricing;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing cycle label, re-derived whenever the bag balance changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Open,
    Completed,
}

impl BillingCycle {
    /// Derive the cycle from the current bag balance.
    pub fn for_balance(bags_stored: i64) -> Self {
        if bags_stored > 0 {
            Self::Open
        } else {
            Self::Completed
        }
    }

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown billing cycle '{}'", other)),
        }
    }
}

impl TryFrom<String> for BillingCycle {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StorageRecord {
    pub record_id: Uuid,
    pub warehouse_id: Uuid,
    pub customer_id: Uuid,
    pub record_number: i64,
    pub commodity: String,
    pub bags_in: i64,
    pub bags_out: i64,
    pub bags_stored: i64,
    pub total_rent_billed: Decimal,
    pub hamali_payable: Decimal,
    #[sqlx(try_from = "String")]
    pub billing_cycle: BillingCycle,
    pub six_month_rate: Option<Decimal>,
    pub twelve_month_rate: Option<Decimal>,
    pub storage_start_date: NaiveDate,
    pub storage_end_date: Option<NaiveDate>,
    pub inflow_invoice_number: Option<String>,
    pub outflow_invoice_number: Option<String>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    #[sqlx(skip)]
    pub payments: Vec<Payment>,
}

impl StorageRecord {
    /// Check if every bag has left the warehouse.
    pub fn is_completed(&self) -> bool {
        self.bags_stored == 0
    }

    /// Rates for this record, falling back to the warehouse defaults per tier.
    pub fn pricing(&self, default: &Pricing) -> Pricing {
        Pricing {
            six_month_rate: self.six_month_rate.unwrap_or(default.six_month_rate),
            twelve_month_rate: self.twelve_month_rate.unwrap_or(default.twelve_month_rate),
        }
    }

    /// Sum of all payments recorded against this record.
    pub fn amount_paid(&self) -> Decimal {
        self.payments.iter().map(|p| p.amount).sum()
    }

    /// Apply a computed update to an in-memory copy of the record.
    pub fn apply(&mut self, update: &RecordUpdate) {
        self.bags_stored = update.bags_stored;
        self.bags_out = update.bags_out;
        self.total_rent_billed = update.total_rent_billed;
        self.storage_end_date = update.storage_end_date;
        self.billing_cycle = update.billing_cycle;
        if self.outflow_invoice_number.is_none() {
            self.outflow_invoice_number = update.outflow_invoice_number.clone();
        }
    }
}

/// New values for the mutable ledger fields of a record.
///
/// `outflow_invoice_number` is only written when the record has none yet;
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub bags_stored: i64,
    pub bags_out: i64,
    pub total_rent_billed: Decimal,
    pub storage_end_date: Option<NaiveDate>,
    pub billing_cycle: BillingCycle,
    pub outflow_invoice_number: Option<String>,
}

/// Input for creating a new storage record on inflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStorageRecord {
    pub customer_id: Uuid,
    pub commodity: String,
    pub bags_in: i64,
    pub hamali_payable: Decimal,
    pub six_month_rate: Option<Decimal>,
    pub twelve_month_rate: Option<Decimal>,
    pub storage_start_date: NaiveDate,
    pub inflow_invoice_number: Option<String>,
}
