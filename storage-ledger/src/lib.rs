//! Storage Ledger - rent billing and outflow ledger for warehouse storage.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use error::LedgerError;
