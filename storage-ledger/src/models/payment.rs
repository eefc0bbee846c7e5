//! Payment model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a payment is meant to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Rent,
    Hamali,
    Other,
}

impl PaymentType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::Hamali => "hamali",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for PaymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rent" => Ok(Self::Rent),
            "hamali" => Ok(Self::Hamali),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown payment type '{}'", other)),
        }
    }
}

impl TryFrom<String> for PaymentType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment attached to exactly one storage record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub record_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    #[sqlx(try_from = "String")]
    pub payment_type: PaymentType,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub payment_type: PaymentType,
    pub notes: Option<String>,
}
