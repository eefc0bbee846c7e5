//! Payments against storage records.

use crate::models::{NewPayment, Payment, PaymentType, StorageRecord, WarehouseContext};
use crate::services::allocator::{allocate_fifo, FifoAllocation, OutstandingDue};
use crate::services::balance::{summarize, BalanceSummary};
use crate::services::notifier::{dispatch, LedgerEvent};
use crate::services::outflow::{ensure_positive_payment, track};
use crate::services::store::{LedgerBatch, LedgerStore, LedgerWrite, Notifier};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Result of spreading one payment over a customer's records.
#[derive(Debug, Clone)]
pub struct FifoCollection {
    pub allocation: FifoAllocation,
    /// One payment row per record that received money, in allocation order.
    pub payments: Vec<Payment>,
}

impl FifoCollection {
    pub fn unallocated(&self) -> Decimal {
        self.allocation.unallocated
    }
}

/// Records payments and reports what is still owed.
#[derive(Clone)]
pub struct PaymentCollector {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
}

impl PaymentCollector {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Attach a payment to one record.
    #[instrument(skip(self, payment), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    pub async fn record_payment(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        payment: NewPayment,
    ) -> Result<Payment, AppError> {
        let result = self.try_record_payment(ctx, record_id, payment).await;
        track("record_payment", &result);
        result
    }

    async fn try_record_payment(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        payment: NewPayment,
    ) -> Result<Payment, AppError> {
        ensure_positive_payment(&payment)?;

        let receipt = self.store.add_payment(ctx, record_id, payment).await?;
        let payment = receipt.payments.into_iter().next().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Commit returned no payment"))
        })?;

        info!(
            payment_id = %payment.payment_id,
            amount = %payment.amount,
            payment_type = %payment.payment_type,
            "Payment recorded"
        );

        self.notify_payment(ctx, &payment).await;

        Ok(payment)
    }

    /// What a record has been billed, what was paid and what is still due.
    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    pub async fn balance(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<BalanceSummary, AppError> {
        let record = self
            .store
            .get_storage_record(ctx, record_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Storage record {} not found", record_id))
            })?;

        Ok(summarize(&record))
    }

    /// Spread one payment over a customer's records, oldest storage first.
    ///
    /// Rent and hamali payments only count what is due of their kind; `Other`
    /// counts everything due. Money no record owes is returned as unallocated
    /// and not written anywhere. A record changed since its due was read fails
    /// the whole collection with `Conflict`.
    #[instrument(skip(self, payment), fields(warehouse_id = %ctx.warehouse_id, customer_id = %customer_id, amount = %payment.amount))]
    pub async fn collect_fifo(
        &self,
        ctx: &WarehouseContext,
        customer_id: Uuid,
        payment: NewPayment,
    ) -> Result<FifoCollection, AppError> {
        let result = self.try_collect_fifo(ctx, customer_id, payment).await;
        track("collect_fifo", &result);
        result
    }

    async fn try_collect_fifo(
        &self,
        ctx: &WarehouseContext,
        customer_id: Uuid,
        payment: NewPayment,
    ) -> Result<FifoCollection, AppError> {
        ensure_positive_payment(&payment)?;

        let records = self.store.list_customer_records(ctx, customer_id).await?;
        let dues: Vec<OutstandingDue> = records
            .iter()
            .map(|record| OutstandingDue {
                record_id: record.record_id,
                total_due: due_for(record, payment.payment_type),
            })
            .collect();

        let allocation = allocate_fifo(&dues, payment.amount);

        // Each paid record is pinned to the version its due was computed from,
        // so a concurrent collection on the same record fails with Conflict.
        let batch = allocation
            .allocations
            .iter()
            .filter(|a| a.amount_applied > Decimal::ZERO)
            .filter_map(|a| {
                records
                    .iter()
                    .find(|r| r.record_id == a.record_id)
                    .map(|record| (record.version, a))
            })
            .fold(LedgerBatch::new(), |batch, (version, a)| {
                batch
                    .push(LedgerWrite::GuardStorageRecord {
                        record_id: a.record_id,
                        expected_version: version,
                    })
                    .push(LedgerWrite::AddPayment {
                        record_id: a.record_id,
                        payment: NewPayment {
                            amount: a.amount_applied,
                            ..payment.clone()
                        },
                    })
            });

        let payments = if batch.is_empty() {
            Vec::new()
        } else {
            self.store.commit(ctx, batch).await?.payments
        };

        info!(
            records = records.len(),
            payments = payments.len(),
            applied = %allocation.total_applied(),
            unallocated = %allocation.unallocated,
            "Payment allocated oldest first"
        );

        for payment in &payments {
            self.notify_payment(ctx, payment).await;
        }

        Ok(FifoCollection {
            allocation,
            payments,
        })
    }

    async fn notify_payment(&self, ctx: &WarehouseContext, payment: &Payment) {
        dispatch(
            self.notifier.as_ref(),
            &LedgerEvent::PaymentRecorded {
                warehouse_id: ctx.warehouse_id,
                record_id: payment.record_id,
                payment_id: payment.payment_id,
                amount: payment.amount,
            },
        )
        .await;
    }
}

fn due_for(record: &StorageRecord, payment_type: PaymentType) -> Decimal {
    let summary = summarize(record);
    match payment_type {
        PaymentType::Rent => summary.rent_due,
        PaymentType::Hamali => summary.hamali_due,
        PaymentType::Other => summary.total_due,
    }
}
