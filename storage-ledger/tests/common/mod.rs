//! Common test utilities for storage-ledger integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::{Arc, Mutex, Once};
use storage_ledger::config::InvoiceConfig;
use storage_ledger::models::{CreateStorageRecord, Pricing, StorageRecord, WarehouseContext};
use storage_ledger::services::{
    InMemoryStore, LedgerStore, Notifier, OutflowOrchestrator, PaymentCollector,
};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,storage_ledger=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Day the test warehouse considers "today".
pub fn today() -> NaiveDate {
    date(2024, 6, 30)
}

/// Notifier that keeps every event it was given.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn last_payload(&self) -> Option<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .last()
            .map(|(_, payload)| payload.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), AppError> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
        Ok(())
    }
}

/// Notifier whose delivery always fails.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, event: &str, _payload: serde_json::Value) -> Result<(), AppError> {
        Err(AppError::NotificationError(format!(
            "SMS gateway unavailable for {}",
            event
        )))
    }
}

/// In-memory ledger wired the way an application would wire it.
pub struct TestLedger {
    pub ctx: WarehouseContext,
    pub store: Arc<InMemoryStore>,
    pub outflow: OutflowOrchestrator,
    pub payments: PaymentCollector,
}

impl TestLedger {
    pub async fn record(&self, record_id: Uuid) -> StorageRecord {
        self.store
            .get_storage_record(&self.ctx, record_id)
            .await
            .expect("Failed to read record")
            .expect("Record should exist")
    }

    /// Deposit `bags` for a fresh customer on 2023-01-01.
    pub async fn deposit(&self, bags: i64) -> StorageRecord {
        self.deposit_for(Uuid::new_v4(), bags, date(2023, 1, 1)).await
    }

    pub async fn deposit_for(
        &self,
        customer_id: Uuid,
        bags: i64,
        start: NaiveDate,
    ) -> StorageRecord {
        self.outflow
            .record_inflow(&self.ctx, inflow(customer_id, bags, start))
            .await
            .expect("Failed to record inflow")
    }
}

pub fn inflow(customer_id: Uuid, bags: i64, start: NaiveDate) -> CreateStorageRecord {
    CreateStorageRecord {
        customer_id,
        commodity: "wheat".to_string(),
        bags_in: bags,
        hamali_payable: Decimal::ZERO,
        six_month_rate: None,
        twelve_month_rate: None,
        storage_start_date: start,
        inflow_invoice_number: None,
    }
}

pub fn test_ledger() -> (TestLedger, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    (ledger_with_notifier(notifier.clone()), notifier)
}

pub fn ledger_with_notifier(notifier: Arc<dyn Notifier>) -> TestLedger {
    init_tracing();

    let store = Arc::new(InMemoryStore::new(InvoiceConfig::default()));
    let outflow = OutflowOrchestrator::new(
        store.clone(),
        store.clone(),
        notifier.clone(),
        Pricing::default(),
    );
    let payments = PaymentCollector::new(store.clone(), notifier);

    TestLedger {
        ctx: WarehouseContext::on(Uuid::new_v4(), today()),
        store,
        outflow,
        payments,
    }
}
