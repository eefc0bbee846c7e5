//! Collaborator interfaces: persistence, invoice numbering and notifications.

use crate::models::{
    CreateStorageRecord, NewPayment, NewWithdrawalTransaction, Payment, RecordUpdate,
    StorageRecord, WarehouseContext, WithdrawalTransaction, WithdrawalTransactionUpdate,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// One write of a ledger operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerWrite {
    /// Conditional update: fails with `Conflict` unless the stored version
    /// still equals `expected_version`. Bumps the version on success.
    UpdateStorageRecord {
        record_id: Uuid,
        expected_version: i64,
        update: RecordUpdate,
    },
    /// Bumps the version of a record whose ledger fields stay as they are,
    /// failing with `Conflict` if it moved since `expected_version` was read.
    GuardStorageRecord {
        record_id: Uuid,
        expected_version: i64,
    },
    AddPayment {
        record_id: Uuid,
        payment: NewPayment,
    },
    InsertWithdrawalTransaction(NewWithdrawalTransaction),
    UpdateWithdrawalTransaction {
        transaction_id: Uuid,
        update: WithdrawalTransactionUpdate,
    },
    SoftDeleteWithdrawalTransaction {
        transaction_id: Uuid,
    },
}

impl LedgerWrite {
    /// Operation label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateStorageRecord { .. } => "update_storage_record",
            Self::GuardStorageRecord { .. } => "guard_storage_record",
            Self::AddPayment { .. } => "add_payment",
            Self::InsertWithdrawalTransaction(_) => "insert_withdrawal_transaction",
            Self::UpdateWithdrawalTransaction { .. } => "update_withdrawal_transaction",
            Self::SoftDeleteWithdrawalTransaction { .. } => "soft_delete_withdrawal_transaction",
        }
    }
}

/// Ordered writes that are committed together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerBatch {
    writes: Vec<LedgerWrite>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(write: LedgerWrite) -> Self {
        Self {
            writes: vec![write],
        }
    }

    pub fn push(mut self, write: LedgerWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn writes(&self) -> &[LedgerWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

impl IntoIterator for LedgerBatch {
    type Item = LedgerWrite;
    type IntoIter = std::vec::IntoIter<LedgerWrite>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Rows produced by a committed batch, in write order.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub records: Vec<StorageRecord>,
    pub payments: Vec<Payment>,
    pub transactions: Vec<WithdrawalTransaction>,
}

impl CommitReceipt {
    /// The last record version written by the batch.
    pub fn record(&self) -> Option<&StorageRecord> {
        self.records.last()
    }

    pub fn transaction(&self) -> Option<&WithdrawalTransaction> {
        self.transactions.last()
    }
}

/// Record, transaction and payment store.
///
/// Every read is scoped to the context's warehouse. Rows of other warehouses
/// are reported as not found.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch a record with its payments.
    async fn get_storage_record(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Option<StorageRecord>, AppError>;

    /// A customer's records with their payments, oldest storage first.
    async fn list_customer_records(
        &self,
        ctx: &WarehouseContext,
        customer_id: Uuid,
    ) -> Result<Vec<StorageRecord>, AppError>;

    /// Create a record in the open state with the next record number.
    async fn insert_storage_record(
        &self,
        ctx: &WarehouseContext,
        input: &CreateStorageRecord,
    ) -> Result<StorageRecord, AppError>;

    /// Fetch a transaction, including a soft-deleted one.
    async fn get_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<Option<WithdrawalTransaction>, AppError>;

    async fn find_withdrawal_by_idempotency_key(
        &self,
        ctx: &WarehouseContext,
        idempotency_key: &str,
    ) -> Result<Option<WithdrawalTransaction>, AppError>;

    /// Live (not soft-deleted) transactions of a record by withdrawal date.
    async fn list_withdrawal_transactions(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Vec<WithdrawalTransaction>, AppError>;

    /// Apply every write of the batch atomically, in order.
    async fn commit(
        &self,
        ctx: &WarehouseContext,
        batch: LedgerBatch,
    ) -> Result<CommitReceipt, AppError>;

    async fn update_storage_record(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        expected_version: i64,
        update: RecordUpdate,
    ) -> Result<CommitReceipt, AppError> {
        let write = LedgerWrite::UpdateStorageRecord {
            record_id,
            expected_version,
            update,
        };
        self.commit(ctx, LedgerBatch::single(write)).await
    }

    async fn add_payment(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
        payment: NewPayment,
    ) -> Result<CommitReceipt, AppError> {
        let write = LedgerWrite::AddPayment { record_id, payment };
        self.commit(ctx, LedgerBatch::single(write)).await
    }

    async fn insert_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction: NewWithdrawalTransaction,
    ) -> Result<CommitReceipt, AppError> {
        let write = LedgerWrite::InsertWithdrawalTransaction(transaction);
        self.commit(ctx, LedgerBatch::single(write)).await
    }

    async fn update_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
        update: WithdrawalTransactionUpdate,
    ) -> Result<CommitReceipt, AppError> {
        let write = LedgerWrite::UpdateWithdrawalTransaction {
            transaction_id,
            update,
        };
        self.commit(ctx, LedgerBatch::single(write)).await
    }

    async fn soft_delete_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<CommitReceipt, AppError> {
        let write = LedgerWrite::SoftDeleteWithdrawalTransaction { transaction_id };
        self.commit(ctx, LedgerBatch::single(write)).await
    }
}

/// Which document an invoice number is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceKind {
    Inflow,
    Outflow,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inflow => "inflow",
            Self::Outflow => "outflow",
        }
    }
}

impl std::fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Issues invoice numbers, unique and increasing per warehouse and kind.
#[async_trait]
pub trait InvoiceSequencer: Send + Sync {
    async fn next_invoice_number(
        &self,
        warehouse_id: Uuid,
        kind: InvoiceKind,
    ) -> Result<String, AppError>;
}

/// Fire-and-forget delivery of ledger events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), AppError>;
}
