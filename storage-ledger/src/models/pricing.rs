//! Tier rates for the rent ladder.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Flat per-bag rate charged for up to six months of storage.
pub const DEFAULT_SIX_MONTH_RATE: i64 = 36;

/// Flat per-bag rate charged for seven to twelve months of storage.
pub const DEFAULT_TWELVE_MONTH_RATE: i64 = 55;

/// Per-bag rates for the two tiers of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub six_month_rate: Decimal,
    pub twelve_month_rate: Decimal,
}

impl Pricing {
    pub fn new(six_month_rate: Decimal, twelve_month_rate: Decimal) -> Self {
        Self {
            six_month_rate,
            twelve_month_rate,
        }
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            six_month_rate: Decimal::from(DEFAULT_SIX_MONTH_RATE),
            twelve_month_rate: Decimal::from(DEFAULT_TWELVE_MONTH_RATE),
        }
    }
}
