//! Ledger notifications: event contract, envelopes and pub/sub mechanics.

pub mod bus;
pub mod emitter;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use emitter::{BusEmitter, EventEmitter, NoopEmitter};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::TenantScoped;
