//! Tiered rent calculation.
//!
//! Rent is not pro-rated. The storage interval is rounded up to whole months
//! and mapped onto a ladder of flat six-month and twelve-month charges.

use crate::models::Pricing;
use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Result of a rent computation for one withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentQuote {
    pub rent_per_bag: Decimal,
    pub total_rent: Decimal,
    pub months_stored: u32,
}

/// Rent calculator.
#[derive(Debug, Clone)]
pub struct RentCalculator;

impl RentCalculator {
    /// Rent owed for withdrawing `bags` that were stored from `start` to `end`.
    pub fn compute_rent(start: NaiveDate, end: NaiveDate, bags: i64, pricing: &Pricing) -> RentQuote {
        let months_stored = months_stored(start, end);
        let rent_per_bag = rent_per_bag(months_stored, pricing);
        let total_rent = (rent_per_bag * Decimal::from(bags)).max(Decimal::ZERO);

        RentQuote {
            rent_per_bag,
            total_rent,
            months_stored,
        }
    }
}

/// Number of billable months between two dates.
///
/// Whole calendar months are counted first; any day past the last whole-month
/// boundary starts another month. An exact boundary does not. `end` on or
/// before `start` bills nothing.
pub fn months_stored(start: NaiveDate, end: NaiveDate) -> u32 {
    if end <= start {
        return 0;
    }

    let mut whole = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if add_months(start, whole) > end {
        whole -= 1;
    }
    let whole = whole.max(0);

    if add_months(start, whole) < end {
        whole as u32 + 1
    } else {
        whole as u32
    }
}

/// Per-bag rent for a number of billable months.
///
/// 1-6 months is one six-month charge, 7-12 one twelve-month charge. Past a
/// year, every completed year is a twelve-month charge and the remainder is
/// billed as its own six- or twelve-month tier.
pub fn rent_per_bag(months: u32, pricing: &Pricing) -> Decimal {
    match months {
        0 => Decimal::ZERO,
        1..=6 => pricing.six_month_rate,
        7..=12 => pricing.twelve_month_rate,
        _ => {
            let full_years = (months - 1) / 12;
            let remainder = months - full_years * 12;
            let remainder_charge = if remainder <= 6 {
                pricing.six_month_rate
            } else {
                pricing.twelve_month_rate
            };
            pricing.twelve_month_rate * Decimal::from(full_years) + remainder_charge
        }
    }
}

// Chrono clamps to the last day of shorter months (Jan 31 + 1 month = Feb 28).
fn add_months(date: NaiveDate, months: i32) -> NaiveDate {
    date.checked_add_months(Months::new(months.max(0) as u32))
        .unwrap_or(NaiveDate::MAX)
}
