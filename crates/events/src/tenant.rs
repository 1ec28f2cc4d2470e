use dispensary_core::TenantId;

use crate::{EventEnvelope, Subscription};

/// Messages that belong to exactly one tenant.
///
/// Subscribers sharing a bus across tenants use this to drop foreign notifications.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id()
    }
}

impl<M: TenantScoped> Subscription<M> {
    /// Drain pending messages, keeping only those of `tenant_id`.
    pub fn drain_for(&self, tenant_id: TenantId) -> Vec<M> {
        self.drain()
            .into_iter()
            .filter(|m| m.tenant_id() == tenant_id)
            .collect()
    }
}
