use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Macro keeps all ID wrappers structurally identical, so new identifier kinds
// stay predictable. The backend assigns opaque document ids, so these wrap
// text rather than a fixed-width numeric type.
macro_rules! define_wire_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Mints a client-local id for records created optimistically
            /// before the server has assigned one.
            pub fn local() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_wire_id!(UserId);
define_wire_id!(ConversationId);
define_wire_id!(MessageId);
