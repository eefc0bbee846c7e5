//! Ledger events and the default notifier.

use crate::services::metrics::record_notification_failure;
use crate::services::store::Notifier;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, warn};
use uuid::Uuid;

/// Something that happened to the ledger, sent after it was committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    InflowRecorded {
        warehouse_id: Uuid,
        record_id: Uuid,
        customer_id: Uuid,
        record_number: i64,
        bags_in: i64,
        invoice_number: Option<String>,
    },
    WithdrawalRecorded {
        warehouse_id: Uuid,
        record_id: Uuid,
        customer_id: Uuid,
        transaction_id: Uuid,
        bags_withdrawn: i64,
        bags_remaining: i64,
        rent: Decimal,
        withdrawal_date: NaiveDate,
        invoice_number: Option<String>,
    },
    WithdrawalReversed {
        warehouse_id: Uuid,
        record_id: Uuid,
        transaction_id: Uuid,
        bags_restored: i64,
        rent_reversed: Decimal,
    },
    WithdrawalRevised {
        warehouse_id: Uuid,
        record_id: Uuid,
        transaction_id: Uuid,
        bags_withdrawn: i64,
        rent: Decimal,
        withdrawal_date: NaiveDate,
    },
    PaymentRecorded {
        warehouse_id: Uuid,
        record_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InflowRecorded { .. } => "inflow.recorded",
            Self::WithdrawalRecorded { .. } => "withdrawal.recorded",
            Self::WithdrawalReversed { .. } => "withdrawal.reversed",
            Self::WithdrawalRevised { .. } => "withdrawal.revised",
            Self::PaymentRecorded { .. } => "payment.recorded",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Send an event after its batch was committed.
///
/// Delivery failures are logged and counted but never returned: the ledger
/// change already happened.
pub async fn dispatch(notifier: &dyn Notifier, event: &LedgerEvent) {
    let name = event.name();
    if let Err(e) = notifier.notify(name, event.payload()).await {
        warn!(event = name, error = %e, "Failed to deliver ledger notification");
        record_notification_failure(name);
    }
}

/// Notifier that only writes events to the log.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), AppError> {
        info!(event = %event, payload = %payload, "Ledger event");
        Ok(())
    }
}
