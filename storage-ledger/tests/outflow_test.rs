//! Withdrawal and reversal integration tests against the in-memory store.

mod common;

use common::{date, ledger_with_notifier, test_ledger, FailingNotifier};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use storage_ledger::models::{BillingCycle, NewPayment, PaymentType, RecordUpdate};
use storage_ledger::services::{LedgerBatch, LedgerStore, LedgerWrite, WithdrawalRequest};
use uuid::Uuid;

fn request(record_id: Uuid, bags: i64, on: chrono::NaiveDate) -> WithdrawalRequest {
    WithdrawalRequest {
        record_id,
        bags,
        withdrawal_date: on,
        payment: None,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn inflow_creates_open_record_with_numbers() {
    let (ledger, notifier) = test_ledger();

    let first = ledger.deposit(100).await;
    let second = ledger.deposit(20).await;

    assert_eq!(first.record_number, 1);
    assert_eq!(second.record_number, 2);
    assert_eq!(first.bags_stored, 100);
    assert_eq!(first.bags_out, 0);
    assert_eq!(first.storage_end_date, None);
    assert_eq!(first.billing_cycle, BillingCycle::Open);
    assert_eq!(first.inflow_invoice_number.as_deref(), Some("IN-000001"));
    assert_eq!(second.inflow_invoice_number.as_deref(), Some("IN-000002"));
    assert_eq!(notifier.names(), vec!["inflow.recorded", "inflow.recorded"]);
}

#[tokio::test]
async fn inflow_rejects_empty_deposit() {
    let (ledger, _) = test_ledger();

    let result = ledger
        .outflow
        .record_inflow(&ledger.ctx, common::inflow(Uuid::new_v4(), 0, date(2023, 1, 1)))
        .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn full_withdrawal_after_nine_months_bills_twelve_month_rate() {
    let (ledger, notifier) = test_ledger();
    let record = ledger.deposit(100).await;

    let outcome = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 100, date(2023, 10, 1)))
        .await
        .expect("Withdrawal should succeed");

    assert_eq!(outcome.rent.months_stored, 9);
    assert_eq!(outcome.rent.rent_per_bag, Decimal::from(55));
    assert_eq!(outcome.rent.total_rent, Decimal::from(5500));
    assert_eq!(outcome.record.bags_stored, 0);
    assert_eq!(outcome.record.bags_out, 100);
    assert_eq!(outcome.record.total_rent_billed, Decimal::from(5500));
    assert_eq!(outcome.record.storage_end_date, Some(date(2023, 10, 1)));
    assert_eq!(outcome.record.billing_cycle, BillingCycle::Completed);
    assert_eq!(outcome.record.version, record.version + 1);
    assert_eq!(outcome.transaction.bags_withdrawn, 100);
    assert_eq!(outcome.transaction.rent_collected, Decimal::from(5500));
    assert!(!outcome.replayed);

    let payload = notifier.last_payload().unwrap();
    assert_eq!(notifier.names().last().unwrap(), "withdrawal.recorded");
    assert_eq!(payload["bags_remaining"], 0);
}

#[tokio::test]
async fn reversal_restores_record_and_retires_transaction() {
    let (ledger, notifier) = test_ledger();
    let record = ledger.deposit(100).await;
    let outcome = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 100, date(2023, 10, 1)))
        .await
        .unwrap();

    let change = ledger
        .outflow
        .reverse_withdrawal(&ledger.ctx, outcome.transaction.transaction_id)
        .await
        .expect("Reversal should succeed");

    assert_eq!(change.record.bags_stored, 100);
    assert_eq!(change.record.bags_out, 0);
    assert_eq!(change.record.total_rent_billed, Decimal::ZERO);
    assert_eq!(change.record.storage_end_date, None);
    assert_eq!(change.record.billing_cycle, BillingCycle::Open);
    assert!(change.transaction.is_deleted());

    let history = ledger
        .outflow
        .list_withdrawal_transactions(&ledger.ctx, record.record_id)
        .await
        .unwrap();
    assert!(history.is_empty());
    assert_eq!(notifier.names().last().unwrap(), "withdrawal.reversed");
}

#[tokio::test]
async fn reversing_twice_is_a_conflict() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(50).await;
    let outcome = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 10, date(2023, 3, 1)))
        .await
        .unwrap();
    let transaction_id = outcome.transaction.transaction_id;

    ledger
        .outflow
        .reverse_withdrawal(&ledger.ctx, transaction_id)
        .await
        .unwrap();
    let second = ledger
        .outflow
        .reverse_withdrawal(&ledger.ctx, transaction_id)
        .await;

    assert!(matches!(second, Err(AppError::Conflict(_))));
    assert_eq!(ledger.record(record.record_id).await.bags_stored, 50);
}

#[tokio::test]
async fn invoice_number_is_assigned_on_first_withdrawal_only() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(100).await;

    let first = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 40, date(2023, 3, 1)))
        .await
        .unwrap();
    let second = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 60, date(2023, 10, 1)))
        .await
        .unwrap();

    assert_eq!(first.record.outflow_invoice_number.as_deref(), Some("OUT-000001"));
    assert_eq!(second.record.outflow_invoice_number.as_deref(), Some("OUT-000001"));
    assert_eq!(second.transaction.invoice_number.as_deref(), Some("OUT-000001"));

    // 40 bags for 2 months at 36, 60 bags for 9 months at 55.
    assert_eq!(first.transaction.rent_collected, Decimal::from(1440));
    assert_eq!(second.transaction.rent_collected, Decimal::from(3300));
    assert_eq!(second.record.total_rent_billed, Decimal::from(4740));
    assert_eq!(second.record.storage_end_date, Some(date(2023, 10, 1)));

    let other = ledger.deposit(10).await;
    let next = ledger
        .outflow
        .withdraw(&ledger.ctx, request(other.record_id, 10, date(2023, 2, 1)))
        .await
        .unwrap();
    assert_eq!(next.record.outflow_invoice_number.as_deref(), Some("OUT-000002"));

    let history = ledger
        .outflow
        .list_withdrawal_transactions(&ledger.ctx, record.record_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].bags_withdrawn, 40);
    assert_eq!(history[1].bags_withdrawn, 60);
}

#[tokio::test]
async fn invalid_withdrawals_are_rejected_without_writes() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(30).await;

    let cases = [
        request(record.record_id, 0, date(2023, 3, 1)),
        request(record.record_id, 31, date(2023, 3, 1)),
        request(record.record_id, 5, date(2022, 12, 31)),
        request(record.record_id, 5, date(2024, 7, 1)),
    ];

    for case in cases {
        let result = ledger.outflow.withdraw(&ledger.ctx, case).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    let unchanged = ledger.record(record.record_id).await;
    assert_eq!(unchanged.bags_stored, 30);
    assert_eq!(unchanged.version, record.version);
    assert_eq!(unchanged.outflow_invoice_number, None);
}

#[tokio::test]
async fn unknown_record_is_not_found() {
    let (ledger, _) = test_ledger();

    let result = ledger
        .outflow
        .withdraw(&ledger.ctx, request(Uuid::new_v4(), 1, date(2023, 3, 1)))
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    let reversal = ledger
        .outflow
        .reverse_withdrawal(&ledger.ctx, Uuid::new_v4())
        .await;
    assert!(matches!(reversal, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn records_are_scoped_to_their_warehouse() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(10).await;
    let elsewhere = storage_ledger::models::WarehouseContext::on(Uuid::new_v4(), common::today());

    let result = ledger
        .outflow
        .withdraw(&elsewhere, request(record.record_id, 1, date(2023, 3, 1)))
        .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn payment_at_withdrawal_is_stored_with_it() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(10).await;

    let mut req = request(record.record_id, 10, date(2023, 5, 1));
    req.payment = Some(NewPayment {
        amount: Decimal::from(200),
        payment_date: date(2023, 5, 1),
        payment_type: PaymentType::Rent,
        notes: Some("cash at gate".to_string()),
    });

    let outcome = ledger.outflow.withdraw(&ledger.ctx, req).await.unwrap();

    assert_eq!(outcome.payment.as_ref().unwrap().amount, Decimal::from(200));
    assert_eq!(outcome.record.payments.len(), 1);
    assert_eq!(outcome.record.amount_paid(), Decimal::from(200));
}

#[tokio::test]
async fn zero_payment_at_withdrawal_is_rejected() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(10).await;

    let mut req = request(record.record_id, 5, date(2023, 5, 1));
    req.payment = Some(NewPayment {
        amount: Decimal::ZERO,
        payment_date: date(2023, 5, 1),
        payment_type: PaymentType::Rent,
        notes: None,
    });

    let result = ledger.outflow.withdraw(&ledger.ctx, req).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert_eq!(ledger.record(record.record_id).await.bags_stored, 10);
}

#[tokio::test]
async fn repeated_idempotency_key_returns_first_withdrawal() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(100).await;

    let mut req = request(record.record_id, 25, date(2023, 4, 1));
    req.idempotency_key = Some("gate-pass-7781".to_string());

    let first = ledger
        .outflow
        .withdraw(&ledger.ctx, req.clone())
        .await
        .unwrap();
    let retry = ledger.outflow.withdraw(&ledger.ctx, req).await.unwrap();

    assert!(!first.replayed);
    assert!(retry.replayed);
    assert_eq!(
        retry.transaction.transaction_id,
        first.transaction.transaction_id
    );
    assert_eq!(retry.record.bags_stored, 75);
    assert_eq!(ledger.record(record.record_id).await.bags_stored, 75);
}

#[tokio::test]
async fn idempotency_key_cannot_be_reused_for_another_record() {
    let (ledger, _) = test_ledger();
    let a = ledger.deposit(10).await;
    let b = ledger.deposit(10).await;

    let mut first = request(a.record_id, 1, date(2023, 4, 1));
    first.idempotency_key = Some("k-1".to_string());
    ledger.outflow.withdraw(&ledger.ctx, first).await.unwrap();

    let mut second = request(b.record_id, 1, date(2023, 4, 1));
    second.idempotency_key = Some("k-1".to_string());
    let result = ledger.outflow.withdraw(&ledger.ctx, second).await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(ledger.record(b.record_id).await.bags_stored, 10);
}

#[tokio::test]
async fn notification_failure_does_not_roll_back() {
    let ledger = ledger_with_notifier(Arc::new(FailingNotifier));
    let record = ledger.deposit(100).await;

    let outcome = ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 100, date(2023, 10, 1)))
        .await
        .expect("Withdrawal should succeed even if notification fails");

    assert_eq!(outcome.record.bags_stored, 0);
    assert_eq!(ledger.record(record.record_id).await.bags_stored, 0);
}

#[tokio::test]
async fn stale_version_update_is_a_conflict() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(100).await;

    ledger
        .outflow
        .withdraw(&ledger.ctx, request(record.record_id, 10, date(2023, 3, 1)))
        .await
        .unwrap();

    // A writer that read the record before the withdrawal.
    let stale = ledger
        .store
        .update_storage_record(
            &ledger.ctx,
            record.record_id,
            record.version,
            RecordUpdate {
                bags_stored: 80,
                bags_out: 20,
                total_rent_billed: Decimal::from(720),
                storage_end_date: None,
                billing_cycle: BillingCycle::Open,
                outflow_invoice_number: None,
            },
        )
        .await;

    assert!(matches!(stale, Err(AppError::Conflict(_))));
    let current = ledger.record(record.record_id).await;
    assert_eq!(current.bags_stored, 90);
    assert_eq!(current.version, record.version + 1);
}

#[tokio::test]
async fn failed_write_rolls_back_whole_batch() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(100).await;

    let batch = LedgerBatch::single(LedgerWrite::UpdateStorageRecord {
        record_id: record.record_id,
        expected_version: record.version,
        update: RecordUpdate {
            bags_stored: 90,
            bags_out: 10,
            total_rent_billed: Decimal::from(360),
            storage_end_date: None,
            billing_cycle: BillingCycle::Open,
            outflow_invoice_number: None,
        },
    })
    .push(LedgerWrite::SoftDeleteWithdrawalTransaction {
        transaction_id: Uuid::new_v4(),
    });

    let result = ledger.store.commit(&ledger.ctx, batch).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    let current = ledger.record(record.record_id).await;
    assert_eq!(current.bags_stored, 100);
    assert_eq!(current.bags_out, 0);
    assert_eq!(current.version, record.version);
    assert!(!current.is_completed());
}

#[tokio::test]
async fn quote_does_not_write() {
    let (ledger, _) = test_ledger();
    let record = ledger.deposit(10).await;

    let quote = ledger
        .outflow
        .quote_withdrawal(&ledger.ctx, record.record_id, 10, date(2024, 2, 1))
        .await
        .unwrap();

    // 13 months: one twelve-month and one six-month charge.
    assert_eq!(quote.months_stored, 13);
    assert_eq!(quote.total_rent, Decimal::from(910));
    assert_eq!(ledger.record(record.record_id).await.bags_stored, 10);
}

#[tokio::test]
async fn record_rates_override_defaults() {
    let (ledger, _) = test_ledger();
    let mut input = common::inflow(Uuid::new_v4(), 10, date(2023, 1, 1));
    input.six_month_rate = Some(Decimal::from(40));
    let record = ledger
        .outflow
        .record_inflow(&ledger.ctx, input)
        .await
        .unwrap();

    let short = ledger
        .outflow
        .quote_withdrawal(&ledger.ctx, record.record_id, 10, date(2023, 3, 1))
        .await
        .unwrap();
    let long = ledger
        .outflow
        .quote_withdrawal(&ledger.ctx, record.record_id, 10, date(2023, 9, 1))
        .await
        .unwrap();

    assert_eq!(short.total_rent, Decimal::from(400));
    assert_eq!(long.total_rent, Decimal::from(550));
}
