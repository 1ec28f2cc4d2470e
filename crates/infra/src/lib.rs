//! Infrastructure layer: ledger stores, the ledger service, event transports, config.

pub mod config;
pub mod event_bus;
pub mod ledger;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, LedgerConfig};
pub use ledger::{
    InMemoryLedgerStore, InventoryLedger, LedgerError, LedgerTransaction, PostgresLedgerStore,
    StockLedgerStore, StoreError,
};
