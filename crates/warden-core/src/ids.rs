//! Branded ID newtypes.
//!
//! Correlation ids, prompt ids, and connection ids are distinct newtypes over
//! `String` so one can never be passed where another is expected. Fresh ids
//! are UUID v7 (time-ordered) generated via [`uuid::Uuid::now_v7`]; ids that
//! arrive over the wire are accepted verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh id: the type prefix plus a UUID v7.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7().simple()))
            }

            /// The id as sent on the wire.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// Correlation id linking a request to its response or event stream.
    RequestId, "req"
}

branded_id! {
    /// Identifier of one permission prompt shown by the mediator.
    PromptId, "prompt"
}

branded_id! {
    /// Identifier of one open channel on the arbiter side.
    ConnectionId, "conn"
}
