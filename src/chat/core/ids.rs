//! Identifier types for conversations and personas.
//!
//! Conversation ids are opaque strings so that histories written by earlier
//! clients (`chat-<millis>`) load unchanged. Freshly minted ids embed a random
//! UUID and are never reused.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declare a string-backed identifier newtype with a consistent API.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            #[inline]
            #[must_use]
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the identifier string.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(IdParseError);
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Error returned when parsing an empty identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("identifier must not be empty")]
pub struct IdParseError;

define_string_id!(
    /// Stable identifier of a conversation.
    ConversationId
);

define_string_id!(
    /// Identifier of a persona (e.g. `drafter`).
    PersonaId
);

impl ConversationId {
    /// Mint a fresh, never-reused conversation id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("chat-{}", Uuid::new_v4().simple()))
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}
