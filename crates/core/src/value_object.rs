//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have **no identity**: two instances with the same attribute values
/// are the same value. They are immutable; to "change" one, build a new one.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct StockKey {
///     product_id: ProductId,
///     variant_id: Option<VariantId>,
///     location_id: LocationId,
/// }
///
/// impl ValueObject for StockKey {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
