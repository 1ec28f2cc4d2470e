//! Inventory ledger domain module.
//!
//! This crate contains the stock rules of the ledger, implemented purely as
//! deterministic domain logic (no IO, no storage, no locking). The transactional
//! orchestration lives in `dispensary-infra`.

pub mod audit;
pub mod events;
pub mod item;
pub mod movement;
pub mod request;

pub use audit::{AuditReport, replay_movements};
pub use events::{LowStock, Restocked, StockEvent, threshold_events};
pub use item::{DEFAULT_LOW_STOCK_THRESHOLD, InventoryItem, InventoryItemId, OnHandChange, StockKey};
pub use movement::{MovementType, StockMovement, StockMovementId};
pub use request::{AdjustStock, FulfillReservation, ProvisionItem, ReservationLine, sort_lines};
