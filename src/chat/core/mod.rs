//! Core chat types, identifiers, configuration, and errors.

pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod types;

pub use config::ChatConfig;
pub use errors::{ChatError, ChatResult};
pub use events::{ChatEvent, EventBus};
pub use ids::{ConversationId, IdParseError, PersonaId};
pub use types::{
    Conversation, NEW_CONVERSATION_TITLE, Persona, Role, TITLE_MAX_CHARS, Turn, derive_title,
};
