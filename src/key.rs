//! Service identity and priority
//!
//! A [`ServiceKey`] identifies a service type at runtime: the `TypeId` drives
//! equality and hashing, the captured type name drives the deterministic
//! ordering used for tie-breaking and diagnostics.

use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;

/// Runtime identity of a service type.
///
/// Cheap to copy; obtained with [`ServiceKey::of`].
///
/// # Examples
///
/// ```rust
/// use ignition::ServiceKey;
///
/// struct Database;
///
/// let key = ServiceKey::of::<Database>();
/// assert!(key.name().contains("Database"));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// Create the key for type `T`.
    #[inline]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The full type name, for diagnostics and deterministic ordering.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The type name with module path segments stripped.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for ServiceKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl std::hash::Hash for ServiceKey {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// Name-based ordering keeps ready-queue draining and cache keys deterministic
// for a given set of types, independent of map iteration order.
impl Ord for ServiceKey {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ServiceKey {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Initialization priority for ready-queue tie-breaking.
///
/// When several services become ready in the same wave, `Critical` drains
/// first and `Low` last; within one priority, type-name order applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Must start before anything that can wait
    Critical,
    /// Important infrastructure (databases, message buses)
    High,
    /// Ordinary services
    #[default]
    Medium,
    /// Background and best-effort services
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Apple;
    struct Banana;

    #[test]
    fn keys_equal_by_type() {
        assert_eq!(ServiceKey::of::<Apple>(), ServiceKey::of::<Apple>());
        assert_ne!(ServiceKey::of::<Apple>(), ServiceKey::of::<Banana>());
    }

    #[test]
    fn keys_order_by_name() {
        let a = ServiceKey::of::<Apple>();
        let b = ServiceKey::of::<Banana>();
        assert!(a < b);
    }

    #[test]
    fn short_name_strips_module_path() {
        assert_eq!(ServiceKey::of::<Apple>().short_name(), "Apple");
    }

    #[test]
    fn priority_ordering_drains_critical_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
