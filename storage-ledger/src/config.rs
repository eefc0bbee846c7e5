//! Configuration module for storage-ledger.

use crate::models::Pricing;
use crate::services::store::InvoiceKind;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct StorageLedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub pricing: Pricing,
    pub invoice: InvoiceConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Prefixes of issued invoice numbers, e.g. `OUT-000042`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceConfig {
    pub inflow_prefix: String,
    pub outflow_prefix: String,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            inflow_prefix: "IN".to_string(),
            outflow_prefix: "OUT".to_string(),
        }
    }
}

impl InvoiceConfig {
    pub fn format(&self, kind: InvoiceKind, sequence: i64) -> String {
        let prefix = match kind {
            InvoiceKind::Inflow => &self.inflow_prefix,
            InvoiceKind::Outflow => &self.outflow_prefix,
        };
        format!("{}-{:06}", prefix, sequence)
    }
}

impl StorageLedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = Pricing::default();
        let invoice_defaults = InvoiceConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "storage-ledger".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            pricing: Pricing {
                six_month_rate: rate_from_env("RENT_SIX_MONTH_RATE", defaults.six_month_rate)?,
                twelve_month_rate: rate_from_env(
                    "RENT_TWELVE_MONTH_RATE",
                    defaults.twelve_month_rate,
                )?,
            },
            invoice: InvoiceConfig {
                inflow_prefix: env::var("INFLOW_INVOICE_PREFIX")
                    .unwrap_or(invoice_defaults.inflow_prefix),
                outflow_prefix: env::var("OUTFLOW_INVOICE_PREFIX")
                    .unwrap_or(invoice_defaults.outflow_prefix),
            },
        })
    }
}

fn rate_from_env(key: &str, default: Decimal) -> Result<Decimal, AppError> {
    match env::var(key) {
        Ok(raw) => {
            let rate = Decimal::from_str(raw.trim()).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("{} is not a valid amount: {}", key, e))
            })?;
            if rate < Decimal::ZERO {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} cannot be negative",
                    key
                )));
            }
            Ok(rate)
        }
        Err(_) => Ok(default),
    }
}
