//! Entity trait: identity that survives state changes, owned by one tenant.

use crate::id::TenantId;

/// Records that keep their identity while their counts change.
///
/// Every ledger record belongs to exactly one tenant; stores and subscribers use
/// [`Entity::belongs_to`] to keep tenants apart.
pub trait Entity {
    /// Strongly-typed identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;

    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}
