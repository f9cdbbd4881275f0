//! Conversation domain: store, context window, generations, personas, and persistence.

pub mod context_builder;
pub mod core;
pub mod persistence;
pub mod personas;
pub mod session;
pub mod store;

pub use persistence::{HistoryStore, PersistedState, SqliteHistoryStore, spawn_autosave};
pub use personas::{PersonaBook, default_personas};
pub use session::{Generation, GenerationOutcome, SessionController};
pub use store::ConversationStore;
