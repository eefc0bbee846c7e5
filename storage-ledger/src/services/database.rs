//! PostgreSQL ledger store.

use crate::config::InvoiceConfig;
use crate::models::{
    BillingCycle, CreateStorageRecord, Payment, StorageRecord, WarehouseContext,
    WithdrawalTransaction,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    CommitReceipt, InvoiceKind, InvoiceSequencer, LedgerBatch, LedgerStore, LedgerWrite,
};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "record_id, warehouse_id, customer_id, record_number, commodity, \
    bags_in, bags_out, bags_stored, total_rent_billed, hamali_payable, billing_cycle, \
    six_month_rate, twelve_month_rate, storage_start_date, storage_end_date, \
    inflow_invoice_number, outflow_invoice_number, version, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, warehouse_id, record_id, bags_withdrawn, \
    rent_collected, withdrawal_date, invoice_number, idempotency_key, created_utc, updated_utc, \
    deleted_utc";

const PAYMENT_COLUMNS: &str =
    "payment_id, record_id, amount, payment_date, payment_type, notes, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    invoice: InvoiceConfig,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url, invoice), fields(service = "storage-ledger"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        invoice: InvoiceConfig,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, invoice })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Row loading
    // -------------------------------------------------------------------------

    async fn attach_payments(
        conn: &mut PgConnection,
        records: &mut [StorageRecord],
    ) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = records.iter().map(|r| r.record_id).collect();
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM storage_payments WHERE record_id = ANY($1) \
             ORDER BY payment_date, created_utc",
            PAYMENT_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load payments: {}", e)))?;

        let mut by_record: HashMap<Uuid, Vec<Payment>> = HashMap::new();
        for payment in payments {
            by_record.entry(payment.record_id).or_default().push(payment);
        }
        for record in records.iter_mut() {
            record.payments = by_record.remove(&record.record_id).unwrap_or_default();
        }

        Ok(())
    }

    async fn load_record(
        conn: &mut PgConnection,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Option<StorageRecord>, AppError> {
        let record = sqlx::query_as::<_, StorageRecord>(&format!(
            "SELECT {} FROM storage_records WHERE warehouse_id = $1 AND record_id = $2",
            RECORD_COLUMNS
        ))
        .bind(ctx.warehouse_id)
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get storage record: {}", e))
        })?;

        match record {
            Some(record) => {
                let mut records = [record];
                Self::attach_payments(conn, &mut records).await?;
                let [record] = records;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Batch writes
    // -------------------------------------------------------------------------

    /// Why a conditional record update matched no row.
    async fn version_mismatch(
        conn: &mut PgConnection,
        ctx: &WarehouseContext,
        record_id: Uuid,
        expected_version: i64,
    ) -> AppError {
        let current: Result<Option<i64>, AppError> = sqlx::query_scalar(
            "SELECT version FROM storage_records WHERE warehouse_id = $1 AND record_id = $2",
        )
        .bind(ctx.warehouse_id)
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_write_error("check storage record version", e));

        match current {
            Ok(Some(found)) => AppError::Conflict(anyhow::anyhow!(
                "Storage record {} was modified concurrently (expected version {}, found {})",
                record_id,
                expected_version,
                found
            )),
            Ok(None) => AppError::NotFound(anyhow::anyhow!(
                "Storage record {} not found",
                record_id
            )),
            Err(e) => e,
        }
    }

    async fn apply_write(
        conn: &mut PgConnection,
        ctx: &WarehouseContext,
        write: LedgerWrite,
        receipt: &mut CommitReceipt,
    ) -> Result<(), AppError> {
        match write {
            LedgerWrite::UpdateStorageRecord {
                record_id,
                expected_version,
                update,
            } => {
                // The invoice number is only ever filled in, never replaced.
                let updated = sqlx::query_as::<_, StorageRecord>(&format!(
                    r#"
                    UPDATE storage_records
                    SET bags_stored = $3,
                        bags_out = $4,
                        total_rent_billed = $5,
                        storage_end_date = $6,
                        billing_cycle = $7,
                        outflow_invoice_number = COALESCE(outflow_invoice_number, $8),
                        version = version + 1,
                        updated_utc = NOW()
                    WHERE warehouse_id = $1 AND record_id = $2 AND version = $9
                    RETURNING {}
                    "#,
                    RECORD_COLUMNS
                ))
                .bind(ctx.warehouse_id)
                .bind(record_id)
                .bind(update.bags_stored)
                .bind(update.bags_out)
                .bind(update.total_rent_billed)
                .bind(update.storage_end_date)
                .bind(update.billing_cycle.as_str())
                .bind(update.outflow_invoice_number.as_deref())
                .bind(expected_version)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("update storage record", e))?;

                let Some(record) = updated else {
                    return Err(Self::version_mismatch(conn, ctx, record_id, expected_version).await);
                };

                let mut records = [record];
                Self::attach_payments(conn, &mut records).await?;
                let [record] = records;
                receipt.records.push(record);
            }
            LedgerWrite::GuardStorageRecord {
                record_id,
                expected_version,
            } => {
                let guarded = sqlx::query_as::<_, StorageRecord>(&format!(
                    r#"
                    UPDATE storage_records
                    SET version = version + 1,
                        updated_utc = NOW()
                    WHERE warehouse_id = $1 AND record_id = $2 AND version = $3
                    RETURNING {}
                    "#,
                    RECORD_COLUMNS
                ))
                .bind(ctx.warehouse_id)
                .bind(record_id)
                .bind(expected_version)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("guard storage record", e))?;

                let Some(record) = guarded else {
                    return Err(Self::version_mismatch(conn, ctx, record_id, expected_version).await);
                };

                let mut records = [record];
                Self::attach_payments(conn, &mut records).await?;
                let [record] = records;
                receipt.records.push(record);
            }
            LedgerWrite::AddPayment { record_id, payment } => {
                let inserted = sqlx::query_as::<_, Payment>(&format!(
                    r#"
                    INSERT INTO storage_payments (payment_id, record_id, warehouse_id, amount, payment_date, payment_type, notes)
                    SELECT $1, record_id, warehouse_id, $4, $5, $6, $7
                    FROM storage_records
                    WHERE warehouse_id = $2 AND record_id = $3
                    RETURNING {}
                    "#,
                    PAYMENT_COLUMNS
                ))
                .bind(Uuid::new_v4())
                .bind(ctx.warehouse_id)
                .bind(record_id)
                .bind(payment.amount)
                .bind(payment.payment_date)
                .bind(payment.payment_type.as_str())
                .bind(&payment.notes)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("add payment", e))?
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Storage record {} not found", record_id))
                })?;

                receipt.payments.push(inserted);
            }
            LedgerWrite::InsertWithdrawalTransaction(input) => {
                let inserted = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
                    r#"
                    INSERT INTO withdrawal_transactions (transaction_id, warehouse_id, record_id, bags_withdrawn, rent_collected, withdrawal_date, invoice_number, idempotency_key)
                    SELECT $1, warehouse_id, record_id, $4, $5, $6, $7, $8
                    FROM storage_records
                    WHERE warehouse_id = $2 AND record_id = $3
                    RETURNING {}
                    "#,
                    TRANSACTION_COLUMNS
                ))
                .bind(input.transaction_id)
                .bind(ctx.warehouse_id)
                .bind(input.record_id)
                .bind(input.bags_withdrawn)
                .bind(input.rent_collected)
                .bind(input.withdrawal_date)
                .bind(&input.invoice_number)
                .bind(&input.idempotency_key)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("insert withdrawal transaction", e))?
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!(
                        "Storage record {} not found",
                        input.record_id
                    ))
                })?;

                receipt.transactions.push(inserted);
            }
            LedgerWrite::UpdateWithdrawalTransaction {
                transaction_id,
                update,
            } => {
                let updated = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
                    r#"
                    UPDATE withdrawal_transactions
                    SET bags_withdrawn = $3,
                        rent_collected = $4,
                        withdrawal_date = $5,
                        updated_utc = NOW()
                    WHERE warehouse_id = $1 AND transaction_id = $2 AND deleted_utc IS NULL
                    RETURNING {}
                    "#,
                    TRANSACTION_COLUMNS
                ))
                .bind(ctx.warehouse_id)
                .bind(transaction_id)
                .bind(update.bags_withdrawn)
                .bind(update.rent_collected)
                .bind(update.withdrawal_date)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("update withdrawal transaction", e))?
                .ok_or_else(|| missing_live_transaction(transaction_id))?;

                receipt.transactions.push(updated);
            }
            LedgerWrite::SoftDeleteWithdrawalTransaction { transaction_id } => {
                let deleted = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
                    r#"
                    UPDATE withdrawal_transactions
                    SET deleted_utc = NOW(),
                        updated_utc = NOW()
                    WHERE warehouse_id = $1 AND transaction_id = $2 AND deleted_utc IS NULL
                    RETURNING {}
                    "#,
                    TRANSACTION_COLUMNS
                ))
                .bind(ctx.warehouse_id)
                .bind(transaction_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_write_error("soft delete withdrawal transaction", e))?
                .ok_or_else(|| missing_live_transaction(transaction_id))?;

                receipt.transactions.push(deleted);
            }
        }
        Ok(())
    }
}

fn map_write_error(operation: &str, e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("Failed to {}: duplicate key", operation))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
            AppError::BadRequest(anyhow::anyhow!(
                "Failed to {}: ledger constraint violated: {}",
                operation,
                db_err.message()
            ))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e)),
    }
}

fn missing_live_transaction(transaction_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!(
        "Withdrawal transaction {} not found or already reversed",
        transaction_id
    ))
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    async fn get_storage_record(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Option<StorageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_storage_record"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e))
        })?;
        let record = Self::load_record(&mut conn, ctx, record_id).await?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, customer_id = %customer_id))]
    async fn list_customer_records(
        &self,
        ctx: &WarehouseContext,
        customer_id: Uuid,
    ) -> Result<Vec<StorageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customer_records"])
            .start_timer();

        let mut conn = self.pool.acquire().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e))
        })?;

        let mut records = sqlx::query_as::<_, StorageRecord>(&format!(
            "SELECT {} FROM storage_records WHERE warehouse_id = $1 AND customer_id = $2 \
             ORDER BY storage_start_date, record_number",
            RECORD_COLUMNS
        ))
        .bind(ctx.warehouse_id)
        .bind(customer_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list records: {}", e)))?;

        Self::attach_payments(&mut conn, &mut records).await?;

        timer.observe_duration();

        Ok(records)
    }

    #[instrument(skip(self, input), fields(warehouse_id = %ctx.warehouse_id, customer_id = %input.customer_id))]
    async fn insert_storage_record(
        &self,
        ctx: &WarehouseContext,
        input: &CreateStorageRecord,
    ) -> Result<StorageRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_storage_record"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let record_number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO record_number_sequences (warehouse_id, last_value)
            VALUES ($1, 1)
            ON CONFLICT (warehouse_id)
            DO UPDATE SET last_value = record_number_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(ctx.warehouse_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error("assign record number", e))?;

        let record = sqlx::query_as::<_, StorageRecord>(&format!(
            r#"
            INSERT INTO storage_records (record_id, warehouse_id, customer_id, record_number, commodity,
                bags_in, bags_out, bags_stored, total_rent_billed, hamali_payable, billing_cycle,
                six_month_rate, twelve_month_rate, storage_start_date, inflow_invoice_number)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $6, 0, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(ctx.warehouse_id)
        .bind(input.customer_id)
        .bind(record_number)
        .bind(&input.commodity)
        .bind(input.bags_in)
        .bind(input.hamali_payable)
        .bind(BillingCycle::for_balance(input.bags_in).as_str())
        .bind(input.six_month_rate)
        .bind(input.twelve_month_rate)
        .bind(input.storage_start_date)
        .bind(&input.inflow_invoice_number)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error("create storage record", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            record_id = %record.record_id,
            record_number = record.record_number,
            bags_in = record.bags_in,
            "Storage record created"
        );

        Ok(record)
    }

    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, transaction_id = %transaction_id))]
    async fn get_withdrawal_transaction(
        &self,
        ctx: &WarehouseContext,
        transaction_id: Uuid,
    ) -> Result<Option<WithdrawalTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_withdrawal_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
            "SELECT {} FROM withdrawal_transactions WHERE warehouse_id = $1 AND transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(ctx.warehouse_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get withdrawal transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(transaction)
    }

    #[instrument(skip(self, idempotency_key), fields(warehouse_id = %ctx.warehouse_id))]
    async fn find_withdrawal_by_idempotency_key(
        &self,
        ctx: &WarehouseContext,
        idempotency_key: &str,
    ) -> Result<Option<WithdrawalTransaction>, AppError> {
        let transaction = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
            "SELECT {} FROM withdrawal_transactions WHERE warehouse_id = $1 AND idempotency_key = $2 LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(ctx.warehouse_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check idempotency: {}", e))
        })?;

        Ok(transaction)
    }

    #[instrument(skip(self), fields(warehouse_id = %ctx.warehouse_id, record_id = %record_id))]
    async fn list_withdrawal_transactions(
        &self,
        ctx: &WarehouseContext,
        record_id: Uuid,
    ) -> Result<Vec<WithdrawalTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_withdrawal_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, WithdrawalTransaction>(&format!(
            r#"
            SELECT {}
            FROM withdrawal_transactions
            WHERE warehouse_id = $1 AND record_id = $2 AND deleted_utc IS NULL
            ORDER BY withdrawal_date, created_utc
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(ctx.warehouse_id)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list withdrawals: {}", e))
        })?;

        timer.observe_duration();

        Ok(transactions)
    }

    /// Apply the batch inside one database transaction.
    #[instrument(skip(self, batch), fields(warehouse_id = %ctx.warehouse_id, writes = batch.len()))]
    async fn commit(
        &self,
        ctx: &WarehouseContext,
        batch: LedgerBatch,
    ) -> Result<CommitReceipt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut receipt = CommitReceipt::default();
        for write in batch {
            if let Err(e) = Self::apply_write(&mut tx, ctx, write, &mut receipt).await {
                tx.rollback().await.ok();
                return Err(e);
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(receipt)
    }
}

#[async_trait]
impl InvoiceSequencer for Database {
    #[instrument(skip(self), fields(warehouse_id = %warehouse_id, kind = %kind))]
    async fn next_invoice_number(
        &self,
        warehouse_id: Uuid,
        kind: InvoiceKind,
    ) -> Result<String, AppError> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO invoice_sequences (warehouse_id, kind, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (warehouse_id, kind)
            DO UPDATE SET last_value = invoice_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(warehouse_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to issue invoice number: {}", e))
        })?;

        Ok(self.invoice.format(kind, sequence))
    }
}
