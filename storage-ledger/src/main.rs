//! Prepares the ledger database: connects, migrates and checks health.

use service_core::error::AppError;
use service_core::observability::init_tracing;
use storage_ledger::config::StorageLedgerConfig;
use storage_ledger::services::metrics::init_metrics;
use storage_ledger::services::Database;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = StorageLedgerConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.otlp_endpoint.as_deref(),
        config.common.log_json,
    );
    init_metrics();

    info!(
        service = %config.service_name,
        version = %config.service_version,
        six_month_rate = %config.pricing.six_month_rate,
        twelve_month_rate = %config.pricing.twelve_month_rate,
        "Starting storage ledger migration"
    );

    let db = Database::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
        config.invoice.clone(),
    )
    .await?;

    db.run_migrations().await?;
    db.health_check().await?;

    info!("Storage ledger database is ready");

    Ok(())
}
