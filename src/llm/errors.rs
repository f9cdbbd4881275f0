//! Error types for the inference transport.

use thiserror::Error;

/// Failure to reach, or be accepted by, the inference server.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The request never produced a response (DNS, refused connection, reset).
    #[error(
        "could not reach host {base_url}: check the URL and ensure the server is running and accepts requests from this client"
    )]
    Unreachable {
        /// Base address that was tried.
        base_url: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status and a message of its own.
    #[error("{message} (status {status})")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Message reported by the server.
        message: String,
    },
    /// The server answered with a non-success status and no usable message.
    #[error("HTTP error, status: {0}")]
    Status(u16),
    /// The HTTP client could not be constructed.
    #[error("http client error: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl ConnectError {
    /// Whether the server could not be reached at all.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// HTTP status reported by the server, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } | Self::Status(status) => Some(*status),
            Self::Unreachable { .. } | Self::ClientBuild(_) => None,
        }
    }
}

/// Terminal failure while reading an established response stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The transport failed mid-stream.
    #[error("stream read failed: {0}")]
    Read(#[source] reqwest::Error),
    /// The server reported an error inside the stream.
    #[error("server error: {0}")]
    Server(String),
    /// The stream was aborted by its owner.
    #[error("stream cancelled")]
    Cancelled,
}

/// A single stream line that could not be decoded.
///
/// Never fatal: the decoder logs it and moves on to the next line.
#[derive(Debug, Error)]
#[error("failed to parse stream line {line:?}: {source}")]
pub struct StreamParseError {
    /// The offending line, lossily decoded.
    pub line: String,
    /// Parser error.
    #[source]
    pub source: serde_json::Error,
}
