//! Strongly Typed Identifiers
//!
//! Every entity the synchronization engine touches is addressed by its own
//! UUID newtype, so a `MetaverseObjectId` can never be handed to an API that
//! expects a `ConnectedSystemObjectId`.
//!
//! # Example
//!
//! ```
//! use xavyo_metaverse::ids::{ConnectedSystemObjectId, MetaverseObjectId};
//!
//! let cso = ConnectedSystemObjectId::new();
//! let mvo = MetaverseObjectId::new();
//!
//! fn requires_mvo(id: MetaverseObjectId) -> String {
//!     id.to_string()
//! }
//!
//! let _ = requires_mvo(mvo);
//! // requires_mvo(cso); // does not compile
//! # let _ = cso;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Error type for ID parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The underlying UUID parse error message.
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random ID using UUID v4.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an ID from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        message: e.to_string(),
                    })
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of a connected system (an HR feed, a directory, a SaaS tenant).
    ConnectedSystemId
);

define_id!(
    /// Identifier of a staged object inside one connected system.
    ConnectedSystemObjectId
);

define_id!(
    /// Identifier of an object type in a connected system's schema.
    ConnectedSystemObjectTypeId
);

define_id!(
    /// Identifier of an attribute in a connected system's schema.
    ConnectedSystemAttributeId
);

define_id!(
    /// Identifier of a reconciled identity record in the metaverse.
    MetaverseObjectId
);

define_id!(
    /// Identifier of a metaverse object type (person, group, ...).
    MetaverseObjectTypeId
);

define_id!(
    /// Identifier of a metaverse attribute.
    MetaverseAttributeId
);

define_id!(
    /// Identifier of a synchronization rule.
    SyncRuleId
);

define_id!(
    /// Identifier of a staged outbound change.
    PendingExportId
);

define_id!(
    /// Identifier of one run-profile execution (a synchronization run).
    ActivityId
);

define_id!(
    /// Identifier of one per-object audit record within a run.
    ExecutionItemId
);
