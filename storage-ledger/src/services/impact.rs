//! Ledger impact of withdrawals, reversals and revisions.
//!
//! All three operations are the same signed delta applied to
//! (`bags_out`, `total_rent_billed`). `bags_stored`, the billing cycle and the
//! storage end date are always re-derived from the result, never adjusted on
//! their own.

use crate::error::LedgerError;
use crate::models::{BillingCycle, RecordUpdate, StorageRecord};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bags and rent of an existing withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalAmounts {
    pub bags: i64,
    pub rent: Decimal,
}

/// Replacement values for an existing withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisedWithdrawal {
    pub bags: i64,
    pub rent: Decimal,
    pub date: NaiveDate,
}

/// Signed change to a record's withdrawn bags and billed rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LedgerDelta {
    bags: i64,
    rent: Decimal,
    closing_date: Option<NaiveDate>,
    /// `closing_date` is the record's last withdrawal date, not a candidate.
    closing_is_final: bool,
}

/// Ledger impact calculator.
#[derive(Debug, Clone)]
pub struct LedgerImpact;

impl LedgerImpact {
    /// Update for withdrawing `bags` with `rent` billed on `date`.
    ///
    /// Withdrawing more than is stored is rejected, not clamped.
    pub fn apply_withdrawal(
        record: &StorageRecord,
        bags: i64,
        rent: Decimal,
        date: NaiveDate,
    ) -> Result<RecordUpdate, LedgerError> {
        if bags <= 0 {
            return Err(LedgerError::NonPositiveBags(bags));
        }
        if bags > record.bags_stored {
            return Err(LedgerError::ExceedsStoredBalance {
                requested: bags,
                available: record.bags_stored,
            });
        }
        ensure_non_negative("Rent", rent)?;

        Ok(apply_delta(
            record,
            LedgerDelta {
                bags,
                rent,
                closing_date: Some(date),
                closing_is_final: false,
            },
        ))
    }

    /// Update that undoes a withdrawal of `bags` billed at `rent`.
    pub fn reverse_withdrawal(record: &StorageRecord, bags: i64, rent: Decimal) -> RecordUpdate {
        apply_delta(
            record,
            LedgerDelta {
                bags: -bags,
                rent: -rent,
                closing_date: None,
                closing_is_final: false,
            },
        )
    }

    /// Update that replaces withdrawal `old` with `new`.
    ///
    /// Only the difference is applied, so the new withdrawal may use up the
    /// bags the old one already took plus whatever is still stored.
    /// `latest_other` is the latest date of the record's other live
    /// withdrawals; a record left completed ends on the later of it and
    /// `new.date`.
    pub fn revise_withdrawal(
        record: &StorageRecord,
        old: WithdrawalAmounts,
        new: RevisedWithdrawal,
        latest_other: Option<NaiveDate>,
    ) -> Result<RecordUpdate, LedgerError> {
        if new.bags <= 0 {
            return Err(LedgerError::NonPositiveBags(new.bags));
        }
        ensure_non_negative("Rent", new.rent)?;

        let bags_diff = new.bags - old.bags;
        if bags_diff > 0 && bags_diff > record.bags_stored {
            return Err(LedgerError::RevisionExceedsBalance {
                additional: bags_diff,
                available: record.bags_stored,
            });
        }

        Ok(apply_delta(
            record,
            LedgerDelta {
                bags: bags_diff,
                rent: new.rent - old.rent,
                closing_date: Some(latest_other.map_or(new.date, |d| d.max(new.date))),
                closing_is_final: true,
            },
        ))
    }
}

fn apply_delta(record: &StorageRecord, delta: LedgerDelta) -> RecordUpdate {
    let bags_out = (record.bags_out + delta.bags).clamp(0, record.bags_in.max(0));
    let bags_stored = record.bags_in - bags_out;
    let total_rent_billed = (record.total_rent_billed + delta.rent).max(Decimal::ZERO);
    let billing_cycle = BillingCycle::for_balance(bags_stored);

    let storage_end_date = match billing_cycle {
        BillingCycle::Open => None,
        BillingCycle::Completed => {
            let closing = if delta.closing_is_final {
                delta.closing_date
            } else {
                record.storage_end_date.max(delta.closing_date)
            };
            closing
                .or(record.storage_end_date)
                .or(Some(record.storage_start_date))
        }
    };

    RecordUpdate {
        bags_stored,
        bags_out,
        total_rent_billed,
        storage_end_date,
        billing_cycle,
        outflow_invoice_number: None,
    }
}

pub(crate) fn ensure_non_negative(field: &'static str, value: Decimal) -> Result<(), LedgerError> {
    if value < Decimal::ZERO {
        return Err(LedgerError::NegativeAmount { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(bags_in: i64, bags_out: i64, rent: i64) -> StorageRecord {
        let bags_stored = bags_in - bags_out;
        StorageRecord {
            record_id: Uuid::new_v4(),
            warehouse_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            record_number: 1,
            commodity: "wheat".to_string(),
            bags_in,
            bags_out,
            bags_stored,
            total_rent_billed: Decimal::from(rent),
            hamali_payable: Decimal::ZERO,
            billing_cycle: BillingCycle::for_balance(bags_stored),
            six_month_rate: None,
            twelve_month_rate: None,
            storage_start_date: date(2023, 1, 1),
            storage_end_date: (bags_stored == 0).then(|| date(2023, 6, 1)),
            inflow_invoice_number: None,
            outflow_invoice_number: None,
            version: 0,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
            payments: Vec::new(),
        }
    }

    fn applied(record: &StorageRecord, update: &RecordUpdate) -> StorageRecord {
        let mut next = record.clone();
        next.apply(update);
        next
    }

    #[test]
    fn test_full_withdrawal_completes_record() {
        let rec = record(100, 0, 0);
        let update =
            LedgerImpact::apply_withdrawal(&rec, 100, Decimal::from(5500), date(2023, 10, 1))
                .unwrap();

        assert_eq!(update.bags_stored, 0);
        assert_eq!(update.bags_out, 100);
        assert_eq!(update.total_rent_billed, Decimal::from(5500));
        assert_eq!(update.storage_end_date, Some(date(2023, 10, 1)));
        assert_eq!(update.billing_cycle, BillingCycle::Completed);
    }

    #[test]
    fn test_partial_withdrawal_stays_open() {
        let rec = record(100, 0, 0);
        let update =
            LedgerImpact::apply_withdrawal(&rec, 40, Decimal::from(1440), date(2023, 3, 1))
                .unwrap();

        assert_eq!(update.bags_stored, 60);
        assert_eq!(update.bags_out, 40);
        assert_eq!(update.storage_end_date, None);
        assert_eq!(update.billing_cycle, BillingCycle::Open);
    }

    #[test]
    fn test_withdrawal_over_balance_is_rejected() {
        let rec = record(100, 70, 0);
        let result = LedgerImpact::apply_withdrawal(&rec, 31, Decimal::ZERO, date(2023, 3, 1));
        assert_eq!(
            result,
            Err(LedgerError::ExceedsStoredBalance {
                requested: 31,
                available: 30
            })
        );
    }

    #[test]
    fn test_withdrawal_of_zero_bags_is_rejected() {
        let rec = record(100, 0, 0);
        let result = LedgerImpact::apply_withdrawal(&rec, 0, Decimal::ZERO, date(2023, 3, 1));
        assert_eq!(result, Err(LedgerError::NonPositiveBags(0)));
    }

    #[test]
    fn test_reversal_reopens_completed_record() {
        let rec = record(100, 100, 5500);
        let update = LedgerImpact::reverse_withdrawal(&rec, 100, Decimal::from(5500));

        assert_eq!(update.bags_stored, 100);
        assert_eq!(update.bags_out, 0);
        assert_eq!(update.total_rent_billed, Decimal::ZERO);
        assert_eq!(update.storage_end_date, None);
        assert_eq!(update.billing_cycle, BillingCycle::Open);
    }

    #[test]
    fn test_reversal_floors_counters() {
        let rec = record(100, 10, 100);
        let update = LedgerImpact::reverse_withdrawal(&rec, 25, Decimal::from(500));

        assert_eq!(update.bags_out, 0);
        assert_eq!(update.bags_stored, 100);
        assert_eq!(update.total_rent_billed, Decimal::ZERO);
    }

    #[test]
    fn test_revision_can_use_bags_of_replaced_withdrawal() {
        // 40 withdrawn, 60 left; revising 40 -> 100 needs exactly the 60 left.
        let rec = record(100, 40, 1440);
        let update = LedgerImpact::revise_withdrawal(
            &rec,
            WithdrawalAmounts {
                bags: 40,
                rent: Decimal::from(1440),
            },
            RevisedWithdrawal {
                bags: 100,
                rent: Decimal::from(3600),
                date: date(2023, 4, 1),
            },
            None,
        )
        .unwrap();

        assert_eq!(update.bags_stored, 0);
        assert_eq!(update.bags_out, 100);
        assert_eq!(update.total_rent_billed, Decimal::from(3600));
        assert_eq!(update.storage_end_date, Some(date(2023, 4, 1)));
    }

    #[test]
    fn test_revision_over_balance_is_rejected() {
        let rec = record(100, 40, 1440);
        let result = LedgerImpact::revise_withdrawal(
            &rec,
            WithdrawalAmounts {
                bags: 40,
                rent: Decimal::from(1440),
            },
            RevisedWithdrawal {
                bags: 101,
                rent: Decimal::from(3636),
                date: date(2023, 4, 1),
            },
            None,
        );
        assert_eq!(
            result,
            Err(LedgerError::RevisionExceedsBalance {
                additional: 61,
                available: 60
            })
        );
    }

    #[test]
    fn test_revision_down_reopens_completed_record() {
        let rec = record(100, 100, 5500);
        let update = LedgerImpact::revise_withdrawal(
            &rec,
            WithdrawalAmounts {
                bags: 100,
                rent: Decimal::from(5500),
            },
            RevisedWithdrawal {
                bags: 80,
                rent: Decimal::from(4400),
                date: date(2023, 10, 1),
            },
            None,
        )
        .unwrap();

        assert_eq!(update.bags_stored, 20);
        assert_eq!(update.total_rent_billed, Decimal::from(4400));
        assert_eq!(update.storage_end_date, None);
        assert_eq!(update.billing_cycle, BillingCycle::Open);
    }

    #[test]
    fn test_revision_of_completed_record_keeps_latest_end_date() {
        let rec = record(100, 100, 5500);
        let update = LedgerImpact::revise_withdrawal(
            &rec,
            WithdrawalAmounts {
                bags: 30,
                rent: Decimal::from(1080),
            },
            RevisedWithdrawal {
                bags: 30,
                rent: Decimal::from(1650),
                date: date(2023, 2, 1),
            },
            Some(date(2023, 6, 1)),
        )
        .unwrap();

        assert_eq!(update.bags_stored, 0);
        assert_eq!(update.total_rent_billed, Decimal::from(6070));
        assert_eq!(update.storage_end_date, Some(date(2023, 6, 1)));
    }

    #[test]
    fn test_moving_closing_withdrawal_earlier_moves_end_date() {
        // The only withdrawal closed the record on 2023-06-01.
        let rec = record(100, 100, 5500);
        let update = LedgerImpact::revise_withdrawal(
            &rec,
            WithdrawalAmounts {
                bags: 100,
                rent: Decimal::from(5500),
            },
            RevisedWithdrawal {
                bags: 100,
                rent: Decimal::from(3600),
                date: date(2023, 5, 1),
            },
            None,
        )
        .unwrap();

        assert_eq!(update.storage_end_date, Some(date(2023, 5, 1)));
        assert_eq!(update.billing_cycle, BillingCycle::Completed);
    }

    proptest! {
        #[test]
        fn prop_withdraw_then_reverse_restores_record(
            bags_in in 1i64..10_000,
            out_ratio in 0.0f64..1.0,
            take_ratio in 0.0f64..1.0,
            prior_rent in 0i64..1_000_000,
            rent in 0i64..1_000_000,
        ) {
            let bags_out = ((bags_in as f64) * out_ratio) as i64;
            prop_assume!(bags_out < bags_in);
            let rec = record(bags_in, bags_out, prior_rent);
            let bags = 1 + (((rec.bags_stored - 1) as f64) * take_ratio) as i64;

            let withdrawn = applied(
                &rec,
                &LedgerImpact::apply_withdrawal(&rec, bags, Decimal::from(rent), date(2023, 8, 1)).unwrap(),
            );
            let restored = applied(
                &withdrawn,
                &LedgerImpact::reverse_withdrawal(&withdrawn, bags, Decimal::from(rent)),
            );

            prop_assert_eq!(restored.bags_stored, rec.bags_stored);
            prop_assert_eq!(restored.bags_out, rec.bags_out);
            prop_assert_eq!(restored.total_rent_billed, rec.total_rent_billed);
            prop_assert_eq!(restored.storage_end_date, rec.storage_end_date);
        }

        #[test]
        fn prop_balance_and_end_date_invariants_hold(
            bags_in in 1i64..5_000,
            steps in proptest::collection::vec((0u8..3, 1i64..5_000, 0i64..100_000), 1..20),
        ) {
            let mut rec = record(bags_in, 0, 0);
            let mut history: Vec<WithdrawalAmounts> = Vec::new();

            for (op, bags, rent) in steps {
                let rent = Decimal::from(rent);
                let update = match op {
                    0 => match LedgerImpact::apply_withdrawal(&rec, bags, rent, date(2023, 9, 1)) {
                        Ok(update) => {
                            history.push(WithdrawalAmounts { bags, rent });
                            update
                        }
                        Err(_) => continue,
                    },
                    1 => match history.pop() {
                        Some(old) => LedgerImpact::reverse_withdrawal(&rec, old.bags, old.rent),
                        None => continue,
                    },
                    _ => match history.pop() {
                        Some(old) => {
                            let new = RevisedWithdrawal { bags, rent, date: date(2023, 11, 1) };
                            match LedgerImpact::revise_withdrawal(&rec, old, new, None) {
                                Ok(update) => {
                                    history.push(WithdrawalAmounts { bags, rent });
                                    update
                                }
                                Err(_) => {
                                    history.push(old);
                                    continue;
                                }
                            }
                        }
                        None => continue,
                    },
                };
                rec.apply(&update);

                prop_assert_eq!(rec.bags_stored, rec.bags_in - rec.bags_out);
                prop_assert!(rec.bags_stored >= 0);
                prop_assert!(rec.total_rent_billed >= Decimal::ZERO);
                prop_assert_eq!(rec.storage_end_date.is_some(), rec.bags_stored == 0);
                prop_assert_eq!(rec.billing_cycle, BillingCycle::for_balance(rec.bags_stored));
            }
        }

        #[test]
        fn prop_rejected_revision_reports_error(
            bags_in in 2i64..5_000,
            old_bags_ratio in 0.0f64..1.0,
            extra in 1i64..1_000,
        ) {
            let old_bags = 1 + (((bags_in - 1) as f64) * old_bags_ratio) as i64;
            let rec = record(bags_in, old_bags, 100);
            let new_bags = old_bags + rec.bags_stored + extra;

            let result = LedgerImpact::revise_withdrawal(
                &rec,
                WithdrawalAmounts { bags: old_bags, rent: Decimal::from(100) },
                RevisedWithdrawal { bags: new_bags, rent: Decimal::from(200), date: date(2023, 4, 1) },
                None,
            );
            let is_over_balance = matches!(result, Err(LedgerError::RevisionExceedsBalance { .. }));
            prop_assert!(is_over_balance);
        }
    }
}
