use std::fmt;

use strata_common::labels::OWNER_LABEL;
use strata_common::store::{ObjectKind, StoreEvent};

/// Identity of a StrataCluster: the unit of work and of mutual exclusion
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Key for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Owning cluster of the object an event is about
    ///
    /// Cluster events map to themselves; sub-resource events map through the
    /// owner label. Objects without one are not ours and map to nothing.
    pub fn for_event(event: &StoreEvent) -> Option<Self> {
        match event.kind {
            ObjectKind::Cluster => Some(Self::new(&event.namespace, &event.name)),
            ObjectKind::Pod | ObjectKind::Service => event
                .labels
                .get(OWNER_LABEL)
                .map(|owner| Self::new(&event.namespace, owner)),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
