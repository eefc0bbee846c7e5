//! In-process ledger store.
//!
//! A batch is applied to a copy of the state and only swapped in when every
//! write succeeded, so a failing write leaves nothing behind.

use crate::config::InvoiceConfig;
use crate::models::{
    BillingCycle, CreateStorageRecord, Payment, StorageRecord, WarehouseContext,
    WithdrawalTransaction,
};
use crate::services::store::{
    CommitReceipt, InvoiceKind, InvoiceSequencer, LedgerBatch, LedgerStore, LedgerWrite,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct State {
    records: HashMap<Uuid, StorageRecord>,
    transactions: HashMap<Uuid, WithdrawalTransaction>,
    record_numbers: HashMap<Uuid, i64>,
    invoice_sequences: HashMap<(Uuid, InvoiceKind), i64>,
}

impl State {
    fn record_mut(
        &mut self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<&mut StorageRecord, AppError> {
        self.records
            .get_mut(&record_id)
            .filter(|r| r.warehouse_id == ctx.warehouse_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Storage record {} not found", record_id))
            })
    }

    fn versioned_record_mut(
        &mut self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        expected_version: i64,
    ) -> Result<&mut StorageRecord, AppError> {
        let record = self.record_mut(ctx, record_id)?;
        if record.version != expected_version {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Storage record {} was modified concurrently (expected version {}, found {})",
                record_id,
                expected_version,
                record.version
            )));
        }
        record.version += 1;
        Ok(record)
    }

    fn live_transaction_mut(
        &mut self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<&mut WithdrawalTransaction, AppError> {
        let transaction = self
            .transactions
            .get_mut(&transaction_id)
            .filter(|t| t.warehouse_id == ctx.warehouse_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Withdrawal transaction {} not found",
                    transaction_id
                ))
            })?;
        if transaction.is_deleted() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Withdrawal transaction {} has been reversed",
                transaction_id
            )));
        }
        Ok(transaction)
    }

    fn apply(
        &mut self,
        ctx: &WarehouseContext,
        write: LedgerWrite,
        receipt: &mut CommitReceipt,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        match write {
            LedgerWrite::UpdateStorageRecord {
                record_id,
                expected_version,
                update,
            } => {
                let record = self.versioned_record_mut(ctx, record_id, expected_version)?;
                record.apply(&update);
                record.updated_utc = now;
                receipt.records.push(record.clone());
            }
            LedgerWrite::GuardStorageRecord {
                record_id,
                expected_version,
            } => {
                let record = self.versioned_record_mut(ctx, record_id, expected_version)?;
                record.updated_utc = now;
                receipt.records.push(record.clone());
            }
            LedgerWrite::AddPayment { record_id, payment } => {
                let record = self.record_mut(ctx, record_id)?;
                let payment = Payment {
                    payment_id: Uuid::new_v4(),
                    record_id,
                    amount: payment.amount,
                    payment_date: payment.payment_date,
                    payment_type: payment.payment_type,
                    notes: payment.notes,
                    created_utc: now,
                };
                record.payments.push(payment.clone());
                receipt.payments.push(payment);
            }
            LedgerWrite::InsertWithdrawalTransaction(input) => {
                self.record_mut(ctx, input.record_id)?;
                if self.transactions.contains_key(&input.transaction_id) {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Withdrawal transaction {} already exists",
                        input.transaction_id
                    )));
                }
                if let Some(key) = input.idempotency_key.as_deref() {
                    let duplicate = self.transactions.values().any(|t| {
                        t.warehouse_id == ctx.warehouse_id
                            && t.idempotency_key.as_deref() == Some(key)
                    });
                    if duplicate {
                        return Err(AppError::Conflict(anyhow::anyhow!(
                            "Duplicate idempotency key"
                        )));
                    }
                }
                let transaction = WithdrawalTransaction {
                    transaction_id: input.transaction_id,
                    warehouse_id: ctx.warehouse_id,
                    record_id: input.record_id,
                    bags_withdrawn: input.bags_withdrawn,
                    rent_collected: input.rent_collected,
                    withdrawal_date: input.withdrawal_date,
                    invoice_number: input.invoice_number,
                    idempotency_key: input.idempotency_key,
                    created_utc: now,
                    updated_utc: now,
                    deleted_utc: None,
                };
                self.transactions
                    .insert(transaction.transaction_id, transaction.clone());
                receipt.transactions.push(transaction);
            }
            LedgerWrite::UpdateWithdrawalTransaction {
                transaction_id,
                update,
            } => {
                let transaction = self.live_transaction_mut(ctx, transaction_id)?;
                transaction.bags_withdrawn = update.bags_withdrawn;
                transaction.rent_collected = update.rent_collected;
                transaction.withdrawal_date = update.withdrawal_date;
                transaction.updated_utc = now;
                receipt.transactions.push(transaction.clone());
            }
            LedgerWrite::SoftDeleteWithdrawalTransaction { transaction_id } => {
                let transaction = self.live_transaction_mut(ctx, transaction_id)?;
                transaction.deleted_utc = Some(now);
                transaction.updated_utc = now;
                receipt.transactions.push(transaction.clone());
            }
        }
        Ok(())
    }
}

/// Ledger store held in memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    invoice: InvoiceConfig,
}

impl InMemoryStore {
    pub fn new(invoice: InvoiceConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            invoice,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Ledger state lock poisoned")))
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn get_storage_record(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Option<StorageRecord>, AppError> {
        let state = self.lock()?;
        Ok(state
            .records
            .get(&record_id)
            .filter(|r| r.warehouse_id == ctx.warehouse_id)
            .cloned())
    }

    async fn list_customer_records(
        &self,
        ctx: &WarehouseContext,
        customer_id: Uuid,
    ) -> Result<Vec<StorageRecord>, AppError> {
        let state = self.lock()?;
        let mut records: Vec<StorageRecord> = state
            .records
            .values()
            .filter(|r| r.warehouse_id == ctx.warehouse_id && r.customer_id == customer_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.storage_start_date, r.record_number));
        Ok(records)
    }

    #[instrument(skip(self, input), fields(warehouse_id = %ctx.warehouse_id))]
    async fn insert_storage_record(
        &self,
        ctx: &WarehouseContext,
        input: &CreateStorageRecord,
    ) -> Result<StorageRecord, AppError> {
        let mut state = self.lock()?;
        let number = state.record_numbers.entry(ctx.warehouse_id).or_insert(0);
        *number += 1;
        let record_number = *number;

        let now = Utc::now();
        let record = StorageRecord {
            record_id: Uuid::new_v4(),
            warehouse_id: ctx.warehouse_id,
            customer_id: input.customer_id,
            record_number,
            commodity: input.commodity.clone(),
            bags_in: input.bags_in,
            bags_out: 0,
            bags_stored: input.bags_in,
            total_rent_billed: Decimal::ZERO,
            hamali_payable: input.hamali_payable,
            billing_cycle: BillingCycle::for_balance(input.bags_in),
            six_month_rate: input.six_month_rate,
            twelve_month_rate: input.twelve_month_rate,
            storage_start_date: input.storage_start_date,
            storage_end_date: None,
            inflow_invoice_number: input.inflow_invoice_number.clone(),
            outflow_invoice_number: None,
            version: 0,
            created_utc: now,
            updated_utc: now,
            payments: Vec::new(),
        };
        state.records.insert(record.record_id, record.clone());
        debug!(record_id = %record.record_id, record_number, "Storage record stored");

        Ok(record)
    }

    async fn get_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<Option<WithdrawalTransaction>, AppError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .get(&transaction_id)
            .filter(|t| t.warehouse_id == ctx.warehouse_id)
            .cloned())
    }

    async fn find_withdrawal_by_idempotency_key(
        &self,
        ctx: &WarehouseContext,
        idempotency_key: &str,
    ) -> Result<Option<WithdrawalTransaction>, AppError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .values()
            .find(|t| {
                t.warehouse_id == ctx.warehouse_id
                    && t.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn list_withdrawal_transactions(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Vec<WithdrawalTransaction>, AppError> {
        let state = self.lock()?;
        let mut transactions: Vec<WithdrawalTransaction> = state
            .transactions
            .values()
            .filter(|t| {
                t.warehouse_id == ctx.warehouse_id && t.record_id == record_id && !t.is_deleted()
            })
            .cloned()
            .collect();
        transactions.sort_by_key(|t| (t.withdrawal_date, t.created_utc));
        Ok(transactions)
    }

    #[instrument(skip(self, batch), fields(warehouse_id = %ctx.warehouse_id, writes = batch.len()))]
    async fn commit(
        &self,
        ctx: &WarehouseContext,
        batch: LedgerBatch,
    ) -> Result<CommitReceipt, AppError> {
        let mut state = self.lock()?;
        let mut staged = state.clone();
        let mut receipt = CommitReceipt::default();

        for write in batch {
            let name = write.name();
            staged.apply(ctx, write, &mut receipt).map_err(|e| {
                debug!(write = name, error = %e, "Batch rolled back");
                e
            })?;
        }

        *state = staged;
        Ok(receipt)
    }
}

#[async_trait]
impl InvoiceSequencer for InMemoryStore {
    async fn next_invoice_number(
        &self,
        warehouse_id: Uuid,
        kind: InvoiceKind,
    ) -> Result<String, AppError> {
        let mut state = self.lock()?;
        let sequence = state
            .invoice_sequences
            .entry((warehouse_id, kind))
            .or_insert(0);
        *sequence += 1;
        Ok(self.invoice.format(kind, *sequence))
    }
}
