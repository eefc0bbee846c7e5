//! Domain models for storage-ledger.

mod context;
mod payment;
mod pricing;
mod record;
mod withdrawal;

pub use context::WarehouseContext;
pub use payment::{NewPayment, Payment, PaymentType};
pub use pricing::{DEFAULT_SIX_MONTH_RATE, DEFAULT_TWELVE_MONTH_RATE, Pricing};
pub use record::{BillingCycle, CreateStorageRecord, RecordUpdate, StorageRecord};
pub use withdrawal::{NewWithdrawalTransaction, WithdrawalTransaction, WithdrawalTransactionUpdate};
