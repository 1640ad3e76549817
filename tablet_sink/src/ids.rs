//! Identifier newtypes used across the load path.

use std::fmt::Display;

use uuid::Uuid;

macro_rules! int_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        #[allow(missing_docs)]
        impl $name {
            pub const fn new(v: i64) -> Self {
                Self(v)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(
    /// Identifies a logical index of the table: the base table or one of its
    /// derived (rollup / materialised) indexes.
    IndexId
);

int_id!(
    /// Identifies one partition of the table.
    PartitionId
);

int_id!(
    /// Identifies a tablet, the physical shard replicated across nodes.
    TabletId
);

int_id!(
    /// Identifies a storage node.
    NodeId
);

/// Identifies one load job. Sent with every request so storage nodes can tell
/// concurrent loads apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadId(Uuid);

impl LoadId {
    /// Generate a new random [`LoadId`].
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LoadId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for LoadId {
    fn from(v: Uuid) -> Self {
        Self(v)
    }
}

impl Display for LoadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
