//! Error types for the chat core.

use thiserror::Error;

use crate::chat::core::ids::ConversationId;
use crate::llm::errors::ConnectError;

/// Chat core error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A generation is already running for this conversation.
    #[error("a generation is already in progress for conversation {0}")]
    AlreadyGenerating(ConversationId),
    /// No conversation with this id exists.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    /// The submitted message is blank.
    #[error("message must not be empty")]
    EmptyMessage,
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Inference server could not be reached or rejected the request.
    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),
    /// Persistence backend failure.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
