//! Ledger calculations, orchestration and storage.

pub mod allocator;
pub mod balance;
pub mod database;
pub mod impact;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod outflow;
pub mod payments;
pub mod rent;
pub mod store;

pub use allocator::{allocate_fifo, Allocation, FifoAllocation, OutstandingDue};
pub use balance::{summarize, BalanceSummary};
pub use database::Database;
pub use impact::{LedgerImpact, RevisedWithdrawal, WithdrawalAmounts};
pub use memory::InMemoryStore;
pub use notifier::{LedgerEvent, LogNotifier};
pub use outflow::{
    LedgerChange, OutflowOrchestrator, WithdrawalOutcome, WithdrawalRequest, WithdrawalRevision,
};
pub use payments::{FifoCollection, PaymentCollector};
pub use rent::{RentCalculator, RentQuote};
pub use store::{
    CommitReceipt, InvoiceKind, InvoiceSequencer, LedgerBatch, LedgerStore, LedgerWrite, Notifier,
};
