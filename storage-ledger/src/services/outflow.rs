//! Inflow, withdrawal, reversal and revision of storage records.
//!
//! Each operation reads the record, validates, computes the change with the
//! pure calculators and then commits every write as one [`LedgerBatch`]. The
//! record update always comes first in the batch and carries the version that
//! was read, so a concurrent change to the same record fails the whole batch
//! with `Conflict` instead of being overwritten.

use crate::error::LedgerError;
use crate::models::{
    CreateStorageRecord, NewPayment, NewWithdrawalTransaction, Payment, Pricing, StorageRecord,
    WarehouseContext, WithdrawalTransaction, WithdrawalTransactionUpdate,
};
use crate::services::impact::{
    ensure_non_negative, LedgerImpact, RevisedWithdrawal, WithdrawalAmounts,
};
use crate::services::metrics::{record_operation, record_rent_billed};
use crate::services::notifier::{dispatch, LedgerEvent};
use crate::services::rent::{RentCalculator, RentQuote};
use crate::services::store::{
    CommitReceipt, InvoiceKind, InvoiceSequencer, LedgerBatch, LedgerStore, LedgerWrite, Notifier,
};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A request to take bags out of a storage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub record_id: Uuid,
    pub bags: i64,
    pub withdrawal_date: NaiveDate,
    /// Money handed over at the counter together with the withdrawal.
    pub payment: Option<NewPayment>,
    /// Retried requests with the same key return the first result.
    pub idempotency_key: Option<String>,
}

/// Corrected bags and date of an existing withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRevision {
    pub bags: i64,
    pub withdrawal_date: NaiveDate,
    /// Rent to bill instead of the computed one.
    pub rent: Option<Decimal>,
}

/// Result of a withdrawal.
#[derive(Debug, Clone)]
pub struct WithdrawalOutcome {
    pub record: StorageRecord,
    pub transaction: WithdrawalTransaction,
    pub rent: RentQuote,
    pub payment: Option<Payment>,
    /// The idempotency key was seen before; nothing was written.
    pub replayed: bool,
}

/// Record and transaction after a reversal or revision.
#[derive(Debug, Clone)]
pub struct LedgerChange {
    pub record: StorageRecord,
    pub transaction: WithdrawalTransaction,
}

/// Orchestrates every operation that moves bags or billed rent.
#[derive(Clone)]
pub struct OutflowOrchestrator {
    store: Arc<dyn LedgerStore>,
    sequencer: Arc<dyn InvoiceSequencer>,
    notifier: Arc<dyn Notifier>,
    default_pricing: Pricing,
}

impl OutflowOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sequencer: Arc<dyn InvoiceSequencer>,
        notifier: Arc<dyn Notifier>,
        default_pricing: Pricing,
    ) -> Self {
        Self {
            store,
            sequencer,
            notifier,
            default_pricing,
        }
    }

    /// Create a storage record for bags coming into the warehouse.
    #[instrument(skip(self, input), fields(warehouse_id = %ctx.warehouse_id, customer_id = %input.customer_id))]
    pub async fn record_inflow(
        &self,
        ctx: &WarehouseContext,
        input: CreateStorageRecord,
    ) -> Result<StorageRecord, AppError> {
        let result = self.try_record_inflow(ctx, input).await;
        track("record_inflow", &result);
        result
    }

    async fn try_record_inflow(
        &self,
        ctx: &WarehouseContext,
        mut input: CreateStorageRecord,
    ) -> Result<StorageRecord, AppError> {
        if input.bags_in <= 0 {
            return Err(LedgerError::NonPositiveBags(input.bags_in).into());
        }
        if input.storage_start_date > ctx.today {
            return Err(LedgerError::FutureDate {
                date: input.storage_start_date,
                today: ctx.today,
            }
            .into());
        }
        ensure_non_negative("Hamali", input.hamali_payable)?;
        if let Some(rate) = input.six_month_rate {
            ensure_non_negative("Six-month rate", rate)?;
        }
        if let Some(rate) = input.twelve_month_rate {
            ensure_non_negative("Twelve-month rate", rate)?;
        }

        if input.inflow_invoice_number.is_none() {
            input.inflow_invoice_number = Some(
                self.sequencer
                    .next_invoice_number(ctx.warehouse_id, InvoiceKind::Inflow)
                    .await?,
            );
        }

        let record = self.store.insert_storage_record(ctx, &input).await?;

        info!(
            record_id = %record.record_id,
            record_number = record.record_number,
            bags_in = record.bags_in,
            "Inflow recorded"
        );

        dispatch(
            self.notifier.as_ref(),
            &LedgerEvent::InflowRecorded {
                warehouse_id: ctx.warehouse_id,
                record_id: record.record_id,
                customer_id: record.customer_id,
                record_number: record.record_number,
                bags_in: record.bags_in,
                invoice_number: record.inflow_invoice_number.clone(),
            },
        )
        .await;

        Ok(record)
    }

    /// Rent a withdrawal would be billed, without recording anything.
    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    pub async fn quote_withdrawal(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        bags: i64,
        withdrawal_date: NaiveDate,
    ) -> Result<RentQuote, AppError> {
        let record = self.fetch_record(ctx, record_id).await?;
        validate_withdrawal(&record, bags, withdrawal_date, ctx.today)?;
        Ok(self.rent_for(&record, bags, withdrawal_date))
    }

    /// Withdraw bags, bill their rent and write the audit row.
    #[instrument(skip(self, request), fields(warehouse_id = %ctx.warehouse_id, record_id = %request.record_id, bags = request.bags))]
    pub async fn withdraw(
        &self,
        ctx: &WarehouseContext,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalOutcome, AppError> {
        let result = self.try_withdraw(ctx, request).await;
        track("withdraw", &result);
        result
    }

    async fn try_withdraw(
        &self,
        ctx: &WarehouseContext,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalOutcome, AppError> {
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(outcome) = self.replay(ctx, &request, key).await? {
                return Ok(outcome);
            }
        }

        let record = self.fetch_record(ctx, request.record_id).await?;
        validate_withdrawal(&record, request.bags, request.withdrawal_date, ctx.today)?;
        if let Some(payment) = &request.payment {
            ensure_positive_payment(payment)?;
        }

        let rent = self.rent_for(&record, request.bags, request.withdrawal_date);
        let mut update = LedgerImpact::apply_withdrawal(
            &record,
            request.bags,
            rent.total_rent,
            request.withdrawal_date,
        )?;

        // Only the first withdrawal of a record draws an invoice number.
        let invoice_number = match &record.outflow_invoice_number {
            Some(existing) => existing.clone(),
            None => {
                let issued = self
                    .sequencer
                    .next_invoice_number(ctx.warehouse_id, InvoiceKind::Outflow)
                    .await?;
                update.outflow_invoice_number = Some(issued.clone());
                issued
            }
        };

        let mut batch = LedgerBatch::single(LedgerWrite::UpdateStorageRecord {
            record_id: record.record_id,
            expected_version: record.version,
            update,
        });
        if let Some(payment) = request.payment.clone() {
            batch = batch.push(LedgerWrite::AddPayment {
                record_id: record.record_id,
                payment,
            });
        }
        batch = batch.push(LedgerWrite::InsertWithdrawalTransaction(
            NewWithdrawalTransaction {
                transaction_id: Uuid::new_v4(),
                record_id: record.record_id,
                bags_withdrawn: request.bags,
                rent_collected: rent.total_rent,
                withdrawal_date: request.withdrawal_date,
                invoice_number: Some(invoice_number),
                idempotency_key: request.idempotency_key.clone(),
            },
        ));

        let receipt = match self.store.commit(ctx, batch).await {
            Ok(receipt) => receipt,
            Err(AppError::Conflict(e)) => {
                // A concurrent retry with the same key may have won the race.
                if let Some(key) = request.idempotency_key.as_deref() {
                    if let Some(outcome) = self.replay(ctx, &request, key).await? {
                        return Ok(outcome);
                    }
                }
                return Err(AppError::Conflict(e));
            }
            Err(e) => return Err(e),
        };

        let (mut record, transaction) = committed(&receipt)?;
        let payment = receipt.payments.first().cloned();
        // The record row was written before the payment was attached.
        if let Some(payment) = &payment {
            record.payments.push(payment.clone());
        }

        record_rent_billed(rent.total_rent.to_f64().unwrap_or_default());

        info!(
            transaction_id = %transaction.transaction_id,
            bags_withdrawn = transaction.bags_withdrawn,
            bags_stored = record.bags_stored,
            rent = %rent.total_rent,
            months_stored = rent.months_stored,
            version = record.version,
            billing_cycle = %record.billing_cycle,
            actor_id = ?ctx.actor_id,
            "Withdrawal recorded"
        );

        dispatch(
            self.notifier.as_ref(),
            &LedgerEvent::WithdrawalRecorded {
                warehouse_id: ctx.warehouse_id,
                record_id: record.record_id,
                customer_id: record.customer_id,
                transaction_id: transaction.transaction_id,
                bags_withdrawn: transaction.bags_withdrawn,
                bags_remaining: record.bags_stored,
                rent: transaction.rent_collected,
                withdrawal_date: transaction.withdrawal_date,
                invoice_number: transaction.invoice_number.clone(),
            },
        )
        .await;

        Ok(WithdrawalOutcome {
            record,
            transaction,
            rent,
            payment,
            replayed: false,
        })
    }

    async fn replay(
        &self,
        ctx: &WarehouseContext,
        request: &WithdrawalRequest,
        key: &str,
    ) -> Result<Option<WithdrawalOutcome>, AppError> {
        let Some(transaction) = self
            .store
            .find_withdrawal_by_idempotency_key(ctx, key)
            .await?
        else {
            return Ok(None);
        };

        if transaction.record_id != request.record_id {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Idempotency key was already used for storage record {}",
                transaction.record_id
            )));
        }

        let record = self.fetch_record(ctx, transaction.record_id).await?;
        let rent = self.rent_for(
            &record,
            transaction.bags_withdrawn,
            transaction.withdrawal_date,
        );

        info!(
            transaction_id = %transaction.transaction_id,
            "Withdrawal already recorded for idempotency key"
        );

        Ok(Some(WithdrawalOutcome {
            record,
            transaction,
            rent,
            payment: None,
            replayed: true,
        }))
    }

    /// Undo a withdrawal: restore its bags and rent, then retire its audit row.
    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, transaction_id = %transaction_id))]
    pub async fn reverse_withdrawal(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<LedgerChange, AppError> {
        let result = self.try_reverse_withdrawal(ctx, transaction_id).await;
        track("reverse_withdrawal", &result);
        result
    }

    async fn try_reverse_withdrawal(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<LedgerChange, AppError> {
        let transaction = self.fetch_live_transaction(ctx, transaction_id).await?;
        let record = self.fetch_record(ctx, transaction.record_id).await?;

        let update = LedgerImpact::reverse_withdrawal(
            &record,
            transaction.bags_withdrawn,
            transaction.rent_collected,
        );

        let batch = LedgerBatch::single(LedgerWrite::UpdateStorageRecord {
            record_id: record.record_id,
            expected_version: record.version,
            update,
        })
        .push(LedgerWrite::SoftDeleteWithdrawalTransaction { transaction_id });

        let receipt = self.store.commit(ctx, batch).await?;
        let (record, reversed) = committed(&receipt)?;

        info!(
            record_id = %record.record_id,
            bags_restored = transaction.bags_withdrawn,
            bags_stored = record.bags_stored,
            rent_reversed = %transaction.rent_collected,
            version = record.version,
            billing_cycle = %record.billing_cycle,
            actor_id = ?ctx.actor_id,
            "Withdrawal reversed"
        );

        dispatch(
            self.notifier.as_ref(),
            &LedgerEvent::WithdrawalReversed {
                warehouse_id: ctx.warehouse_id,
                record_id: record.record_id,
                transaction_id,
                bags_restored: transaction.bags_withdrawn,
                rent_reversed: transaction.rent_collected,
            },
        )
        .await;

        Ok(LedgerChange {
            record,
            transaction: reversed,
        })
    }

    /// Correct the bags, date or rent of a withdrawal.
    ///
    /// Rent is recomputed for the new bags and date unless the revision
    /// names it.
    #[instrument(skip(self, revision), fields(warehouse_id = %ctx.warehouse_id, transaction_id = %transaction_id))]
    pub async fn revise_withdrawal(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
        revision: WithdrawalRevision,
    ) -> Result<LedgerChange, AppError> {
        let result = self
            .try_revise_withdrawal(ctx, transaction_id, revision)
            .await;
        track("revise_withdrawal", &result);
        result
    }

    async fn try_revise_withdrawal(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
        revision: WithdrawalRevision,
    ) -> Result<LedgerChange, AppError> {
        let transaction = self.fetch_live_transaction(ctx, transaction_id).await?;
        let record = self.fetch_record(ctx, transaction.record_id).await?;

        if revision.bags <= 0 {
            return Err(LedgerError::NonPositiveBags(revision.bags).into());
        }
        validate_date(&record, revision.withdrawal_date, ctx.today)?;

        let rent = match revision.rent {
            Some(rent) => rent,
            None => {
                self.rent_for(&record, revision.bags, revision.withdrawal_date)
                    .total_rent
            }
        };

        // The record's end date follows its latest live withdrawal.
        let latest_other = self
            .store
            .list_withdrawal_transactions(ctx, record.record_id)
            .await?
            .into_iter()
            .filter(|t| t.transaction_id != transaction_id)
            .map(|t| t.withdrawal_date)
            .max();

        let update = LedgerImpact::revise_withdrawal(
            &record,
            WithdrawalAmounts {
                bags: transaction.bags_withdrawn,
                rent: transaction.rent_collected,
            },
            RevisedWithdrawal {
                bags: revision.bags,
                rent,
                date: revision.withdrawal_date,
            },
            latest_other,
        )?;

        let batch = LedgerBatch::single(LedgerWrite::UpdateStorageRecord {
            record_id: record.record_id,
            expected_version: record.version,
            update,
        })
        .push(LedgerWrite::UpdateWithdrawalTransaction {
            transaction_id,
            update: WithdrawalTransactionUpdate {
                bags_withdrawn: revision.bags,
                rent_collected: rent,
                withdrawal_date: revision.withdrawal_date,
            },
        });

        let receipt = self.store.commit(ctx, batch).await?;
        let (record, revised) = committed(&receipt)?;

        record_rent_billed((rent - transaction.rent_collected).to_f64().unwrap_or_default());

        info!(
            record_id = %record.record_id,
            old_bags = transaction.bags_withdrawn,
            new_bags = revised.bags_withdrawn,
            old_rent = %transaction.rent_collected,
            new_rent = %revised.rent_collected,
            bags_stored = record.bags_stored,
            version = record.version,
            "Withdrawal revised"
        );

        dispatch(
            self.notifier.as_ref(),
            &LedgerEvent::WithdrawalRevised {
                warehouse_id: ctx.warehouse_id,
                record_id: record.record_id,
                transaction_id,
                bags_withdrawn: revised.bags_withdrawn,
                rent: revised.rent_collected,
                withdrawal_date: revised.withdrawal_date,
            },
        )
        .await;

        Ok(LedgerChange {
            record,
            transaction: revised,
        })
    }

    /// Withdrawals of a record that have not been reversed, oldest first.
    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    pub async fn list_withdrawal_transactions(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Vec<WithdrawalTransaction>, AppError> {
        self.fetch_record(ctx, record_id).await?;
        self.store.list_withdrawal_transactions(ctx, record_id).await
    }

    async fn fetch_record(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<StorageRecord, AppError> {
        self.store
            .get_storage_record(ctx, record_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Storage record {} not found", record_id))
            })
    }

    async fn fetch_live_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<WithdrawalTransaction, AppError> {
        let transaction = self
            .store
            .get_withdrawal_transaction(ctx, transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Withdrawal transaction {} not found",
                    transaction_id
                ))
            })?;

        if transaction.is_deleted() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Withdrawal transaction {} has already been reversed",
                transaction_id
            )));
        }

        Ok(transaction)
    }

    fn rent_for(&self, record: &StorageRecord, bags: i64, date: NaiveDate) -> RentQuote {
        RentCalculator::compute_rent(
            record.storage_start_date,
            date,
            bags,
            &record.pricing(&self.default_pricing),
        )
    }
}

fn validate_withdrawal(
    record: &StorageRecord,
    bags: i64,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), LedgerError> {
    if bags <= 0 {
        return Err(LedgerError::NonPositiveBags(bags));
    }
    if bags > record.bags_stored {
        return Err(LedgerError::ExceedsStoredBalance {
            requested: bags,
            available: record.bags_stored,
        });
    }
    validate_date(record, date, today)
}

fn validate_date(
    record: &StorageRecord,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), LedgerError> {
    if date < record.storage_start_date {
        return Err(LedgerError::BeforeStorageStart {
            date,
            start: record.storage_start_date,
        });
    }
    if date > today {
        return Err(LedgerError::FutureDate { date, today });
    }
    Ok(())
}

pub(crate) fn ensure_positive_payment(payment: &NewPayment) -> Result<(), LedgerError> {
    if payment.amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount(payment.amount));
    }
    Ok(())
}

fn committed(
    receipt: &CommitReceipt,
) -> Result<(StorageRecord, WithdrawalTransaction), AppError> {
    let record = receipt.record().cloned().ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("Commit returned no storage record"))
    })?;
    let transaction = receipt.transaction().cloned().ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("Commit returned no withdrawal transaction"))
    })?;
    Ok((record, transaction))
}

pub(crate) fn track<T>(operation: &str, result: &Result<T, AppError>) {
    match result {
        Ok(_) => record_operation(operation, "ok"),
        Err(e) => {
            if e.is_client_error() {
                warn!(operation, error = %e, "Ledger operation rejected");
            } else {
                warn!(operation, error = %e, "Ledger operation failed");
            }
            record_operation(operation, e.kind());
        }
    }
}
