//! Amount owed on a record, split into rent and hamali.

use crate::models::{PaymentType, StorageRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billed vs paid for one storage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub rent_billed: Decimal,
    pub hamali_payable: Decimal,
    pub amount_paid: Decimal,
    pub rent_due: Decimal,
    pub hamali_due: Decimal,
    pub total_due: Decimal,
    /// Paid beyond what the record owes.
    pub credit: Decimal,
}

/// Resolve a record's payments against its rent and hamali.
///
/// Rent payments settle rent and hamali payments settle hamali. `Other`
/// payments settle hamali first and then rent. Overpayment on a typed payment
/// is never moved to the other charge; it is reported as credit.
pub fn summarize(record: &StorageRecord) -> BalanceSummary {
    let paid = |kind: PaymentType| -> Decimal {
        record
            .payments
            .iter()
            .filter(|p| p.payment_type == kind)
            .map(|p| p.amount)
            .sum()
    };
    let rent_paid = paid(PaymentType::Rent);
    let hamali_paid = paid(PaymentType::Hamali);
    let other_paid = paid(PaymentType::Other);

    let rent_billed = record.total_rent_billed;
    let hamali_payable = record.hamali_payable;

    let hamali_open = (hamali_payable - hamali_paid).max(Decimal::ZERO);
    let rent_open = (rent_billed - rent_paid).max(Decimal::ZERO);

    let other_to_hamali = other_paid.min(hamali_open);
    let other_to_rent = (other_paid - other_to_hamali).min(rent_open);

    let hamali_due = hamali_open - other_to_hamali;
    let rent_due = rent_open - other_to_rent;

    let credit = (rent_paid - rent_billed).max(Decimal::ZERO)
        + (hamali_paid - hamali_payable).max(Decimal::ZERO)
        + (other_paid - other_to_hamali - other_to_rent);

    BalanceSummary {
        rent_billed,
        hamali_payable,
        amount_paid: rent_paid + hamali_paid + other_paid,
        rent_due,
        hamali_due,
        total_due: rent_due + hamali_due,
        credit,
    }
}
