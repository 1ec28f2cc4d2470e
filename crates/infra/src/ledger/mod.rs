//! Stock ledger: storage backends and the operations built on them.

pub mod in_memory;
pub mod postgres;
pub mod service;
pub mod store;

pub use in_memory::{InMemoryLedgerStore, InMemoryTransaction};
pub use postgres::{PostgresLedgerStore, PostgresTransaction};
pub use service::{InventoryLedger, LedgerError};
pub use store::{LedgerTransaction, StockLedgerStore, StoreError};
