//! service-core: Shared infrastructure for the warehouse ledger services.
pub mod config;
pub mod error;
pub mod observability;

pub use tracing;
