//! Cancellation targets.
//!
//! A [`Target`] is held by whoever consumes images (a list row, a widget,
//! a download batch). The loader only ever keeps a [`TargetRef`]: the
//! identity plus a weak liveness token. Dropping every clone of a `Target`
//! marks it disposed; pending consumers bound to it are then skipped.

use std::sync::{Arc, Weak};

use uuid::Uuid;

/// Identity of a cancellation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning handle for a cancellation scope.
#[derive(Debug, Clone)]
pub struct Target {
    id: TargetId,
    liveness: Arc<()>,
}

impl Target {
    /// Creates a fresh target with a unique identity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TargetId(Uuid::new_v4()),
            liveness: Arc::new(()),
        }
    }

    /// Returns this target's identity.
    #[must_use]
    pub const fn id(&self) -> TargetId {
        self.id
    }

    pub(crate) fn downgrade(&self) -> TargetRef {
        TargetRef {
            id: self.id,
            liveness: Arc::downgrade(&self.liveness),
        }
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

/// Non-owning reference to a [`Target`].
#[derive(Debug, Clone)]
pub struct TargetRef {
    id: TargetId,
    liveness: Weak<()>,
}

impl TargetRef {
    /// Returns the referenced target's identity.
    #[must_use]
    pub const fn id(&self) -> TargetId {
        self.id
    }

    /// Returns false once every clone of the target has been dropped.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness.strong_count() > 0
    }
}
