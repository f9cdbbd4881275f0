//! Conversation data model.
//!
//! Serialized field names follow the persisted history format
//! (`messages`, `createdAt`, `prompt`, `placeholder`, role `model`).

use serde::{Deserialize, Serialize};

use crate::chat::core::ids::{ConversationId, PersonaId};
use crate::llm::ollama_client::OutboundRole;

/// Title given to a conversation before its first message.
pub const NEW_CONVERSATION_TITLE: &str = "New Conversation";

/// Maximum title length, in characters, before truncation.
pub const TITLE_MAX_CHARS: usize = 40;

/// Author of a turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Human input.
    #[serde(rename = "user")]
    User,
    /// Model output.
    #[serde(rename = "model", alias = "assistant")]
    Assistant,
}

impl Role {
    /// Role used on the wire.
    #[must_use]
    pub const fn outbound(self) -> OutboundRole {
        match self {
            Self::User => OutboundRole::User,
            Self::Assistant => OutboundRole::Assistant,
        }
    }
}

/// One message of a conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Author.
    pub role: Role,
    /// Message text.
    pub text: String,
}

impl Turn {
    /// A user turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    /// Empty assistant turn awaiting streamed text.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }

    /// Whether this is an assistant turn with no text.
    #[must_use]
    pub fn is_empty_assistant(&self) -> bool {
        self.role == Role::Assistant && self.text.is_empty()
    }
}

/// A titled, ordered list of turns.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Stable identifier.
    pub id: ConversationId,
    /// Display title, assigned once from the first user turn.
    pub title: String,
    /// Turns in order.
    #[serde(rename = "messages", alias = "turns", default)]
    pub turns: Vec<Turn>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Conversation {
    /// An empty conversation.
    #[must_use]
    pub fn new(id: ConversationId, created_at: i64) -> Self {
        Self {
            id,
            title: NEW_CONVERSATION_TITLE.to_string(),
            turns: Vec::new(),
            created_at,
        }
    }

    /// Whether the turn at `index` falls outside a context window of `window` turns.
    #[must_use]
    pub fn is_out_of_context(&self, index: usize, window: usize) -> bool {
        self.turns.len().saturating_sub(index) > window
    }
}

/// Derive a conversation title from the first user message.
#[must_use]
pub fn derive_title(first_message: &str) -> String {
    if first_message.chars().count() > TITLE_MAX_CHARS {
        let head: String = first_message.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        first_message.to_string()
    }
}

/// A named system instruction with an input hint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Identifier.
    pub id: PersonaId,
    /// Display name.
    pub name: String,
    /// System instruction sent ahead of the conversation.
    #[serde(rename = "prompt")]
    pub instruction_text: String,
    /// Hint shown in an empty composer.
    #[serde(rename = "placeholder")]
    pub input_hint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_truncation() {
        assert_eq!(derive_title("Hello"), "Hello");
        let exact = "a".repeat(40);
        assert_eq!(derive_title(&exact), exact);
        let long = "b".repeat(41);
        assert_eq!(derive_title(&long), format!("{}...", "b".repeat(40)));
        let accented = "\u{e9}".repeat(45);
        assert_eq!(derive_title(&accented).chars().count(), 43);
    }

    #[test]
    fn test_out_of_context_marker() {
        let mut conversation = Conversation::new(ConversationId::new(), 0);
        conversation.turns = (0..12).map(|i| Turn::user(i.to_string())).collect();
        assert!(conversation.is_out_of_context(0, 10));
        assert!(conversation.is_out_of_context(1, 10));
        assert!(!conversation.is_out_of_context(2, 10));
        assert!(!conversation.is_out_of_context(11, 10));
    }

    #[test]
    fn test_persisted_shape() {
        let raw = r#"{
            "id": "chat-1",
            "title": "Hi",
            "messages": [{"role": "user", "text": "Hi"}, {"role": "model", "text": "Hello!"}],
            "createdAt": 1700000000000
        }"#;
        let conversation: Conversation = serde_json::from_str(raw).expect("conversation");
        assert_eq!(conversation.turns[1], Turn::assistant("Hello!"));
        assert_eq!(conversation.created_at, 1_700_000_000_000);

        let json = serde_json::to_value(&conversation).expect("json");
        assert_eq!(json["messages"][1]["role"], "model");
        assert!(json.get("createdAt").is_some());
    }
}
