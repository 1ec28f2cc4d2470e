//! Fire-and-forget notification contract used by the ledger.
//!
//! The ledger must not depend on who listens or whether delivery works: `emit` returns
//! nothing, and a failing transport is logged and dropped.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use dispensary_core::TenantId;

use crate::{Event, EventBus, EventEnvelope};

/// Narrow emitter contract: no acknowledgement, no effect on the caller.
pub trait EventEmitter<E>: Send + Sync {
    fn emit(&self, tenant_id: TenantId, event: E);
}

impl<E, T> EventEmitter<E> for Arc<T>
where
    T: EventEmitter<E> + ?Sized,
{
    fn emit(&self, tenant_id: TenantId, event: E) {
        (**self).emit(tenant_id, event)
    }
}

/// Emitter that wraps events in JSON envelopes and publishes them on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusEmitter<B> {
    bus: B,
}

impl<B> BusEmitter<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<E, B> EventEmitter<E> for BusEmitter<B>
where
    E: Event + Serialize,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn emit(&self, tenant_id: TenantId, event: E) {
        let envelope = match EventEnvelope::from_typed(tenant_id, &event) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    event_type = event.event_type(),
                    error = %err,
                    "dropping event: payload serialization failed"
                );
                return;
            }
        };

        if let Err(err) = self.bus.publish(envelope) {
            tracing::warn!(
                event_type = event.event_type(),
                %tenant_id,
                error = ?err,
                "dropping event: publish failed"
            );
        }
    }
}

/// Emitter that discards everything (for deployments without subscribers).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl<E> EventEmitter<E> for NoopEmitter {
    fn emit(&self, _tenant_id: TenantId, _event: E) {}
}
