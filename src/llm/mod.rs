//! Inference server transport: HTTP client, stream decoding, and errors.

pub mod errors;
pub mod ollama_client;
pub mod stream_decoder;

#[cfg(test)]
pub(crate) mod mock_ollama;

pub use errors::{ConnectError, StreamError, StreamParseError};
pub use ollama_client::{
    DEFAULT_BASE_URL, DEFAULT_MODEL, OllamaClient, OutboundMessage, OutboundRole, ResponseStream,
    normalize_base_url,
};
pub use stream_decoder::{InferenceEvent, InferenceStream, StreamDecoder};
