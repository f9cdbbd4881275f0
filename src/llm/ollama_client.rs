//! HTTP client for an Ollama-compatible chat server.
//!
//! Behaviour:
//! - `GET {base}/api/tags` as a lightweight reachability probe.
//! - `POST {base}/api/chat` with `stream: true`; the body is handed back as a
//!   [`ResponseStream`] that the caller reads chunk by chunk or aborts.
//!
//! The client holds no global state. It is a plain value configured with a base
//! address and a model id, cheap to clone (the inner `reqwest::Client` is
//! reference counted).

use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::errors::{ConnectError, StreamError};

/// Default inference server address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "phi3:3.8b";

/// Role of a message sent to the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundRole {
    /// System instruction.
    System,
    /// User input.
    User,
    /// Earlier model output.
    Assistant,
}

/// One message of a chat request, as transmitted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Message role.
    pub role: OutboundRole,
    /// Message text.
    pub content: String,
}

impl OutboundMessage {
    /// Build a message.
    #[must_use]
    pub fn new(role: OutboundRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [OutboundMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Strip surrounding whitespace and trailing path separators from an address.
#[must_use]
pub fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Chat transport bound to one endpoint and one model.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    /// Create a client for the given endpoint and model.
    ///
    /// No timeouts are set: a hung server is ended by aborting the stream.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, model: &str) -> Result<Self, ConnectError> {
        let http = Client::builder()
            .build()
            .map_err(ConnectError::ClientBuild)?;
        let mut client = Self {
            http,
            base_url: String::new(),
            model: String::new(),
        };
        client.configure(base_url, model);
        Ok(client)
    }

    /// Replace endpoint and model. Pure configuration, no I/O.
    pub fn configure(&mut self, base_url: &str, model: &str) {
        self.set_base_url(base_url);
        self.set_model(model);
    }

    /// Replace the endpoint.
    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = normalize_base_url(base_url);
    }

    /// Replace the model identifier.
    pub fn set_model(&mut self, model: &str) {
        self.model = model.trim().to_string();
    }

    /// Configured endpoint, already normalized.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Configured model identifier.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Probe the configured endpoint.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if the server is unreachable or rejects the probe.
    pub async fn probe(&self) -> Result<(), ConnectError> {
        self.probe_at(&self.base_url).await
    }

    /// Probe an arbitrary endpoint without touching the configured one.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if the server is unreachable or rejects the probe.
    pub async fn probe_at(&self, base_url: &str) -> Result<(), ConnectError> {
        let base_url = normalize_base_url(base_url);
        let url = format!("{base_url}/api/tags");
        debug!("probing {url}");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ConnectError::Unreachable {
                base_url: base_url.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection(response).await)
        }
    }

    /// Start a streaming chat completion.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if the request cannot be sent or the server
    /// answers with a non-success status.
    pub async fn send_chat(
        &self,
        messages: &[OutboundMessage],
    ) -> Result<ResponseStream, ConnectError> {
        self.send_chat_with(messages, CancellationToken::new()).await
    }

    /// Start a streaming chat completion whose stream aborts when `cancel` fires.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if the request cannot be sent or the server
    /// answers with a non-success status.
    pub async fn send_chat_with(
        &self,
        messages: &[OutboundMessage],
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ConnectError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        debug!(model = %self.model, messages = messages.len(), "POST {url}");

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|source| ConnectError::Unreachable {
                base_url: self.base_url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        Ok(ResponseStream::new(response, cancel))
    }
}

async fn rejection(response: Response) -> ConnectError {
    let status = response.status().as_u16();
    match response.json::<ErrorBody>().await {
        Ok(ErrorBody {
            error: Some(message),
        }) if !message.trim().is_empty() => ConnectError::Rejected { status, message },
        _ => ConnectError::Status(status),
    }
}

/// Raw body of a streaming chat response.
pub struct ResponseStream {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    cancel: CancellationToken,
}

impl ResponseStream {
    fn new(response: Response, cancel: CancellationToken) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self { body, cancel }
    }

    /// Read the next raw chunk, `Ok(None)` once the body is exhausted.
    ///
    /// # Errors
    /// Returns [`StreamError::Cancelled`] once aborted, or
    /// [`StreamError::Read`] if the transport fails.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Cancelled),
            chunk = self.body.next() => match chunk {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(err)) => Err(StreamError::Read(err)),
                None => Ok(None),
            },
        }
    }

    /// Stop reading; pending and future reads return [`StreamError::Cancelled`].
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock_ollama::{ChatScript, MockOllama, closed_port_url};

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://host:11434///"), "http://host:11434");
        assert_eq!(normalize_base_url("  http://host/ "), "http://host");
        assert_eq!(normalize_base_url("http://host"), "http://host");
    }

    #[test]
    fn test_configure_trims_model_and_address() {
        let mut client = OllamaClient::new(DEFAULT_BASE_URL, DEFAULT_MODEL).expect("client");
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
        client.configure("http://10.0.0.2:11434/", " llama3 ");
        assert_eq!(client.base_url(), "http://10.0.0.2:11434");
        assert_eq!(client.model(), "llama3");
    }

    #[tokio::test]
    async fn test_probe_success() {
        let mock = MockOllama::spawn(ChatScript::lines(Vec::<String>::new())).await;
        let client = OllamaClient::new(&mock.base_url(), "m").expect("client");
        assert!(client.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_distinct_from_status() {
        let client = OllamaClient::new(&closed_port_url().await, "m").expect("client");
        let err = client.probe().await.expect_err("probe should fail");
        assert!(err.is_unreachable());
        assert!(err.to_string().contains("could not reach host"));

        let mock = MockOllama::spawn_with_tags_status(500, "oops").await;
        let client = OllamaClient::new(&mock.base_url(), "m").expect("client");
        let err = client.probe().await.expect_err("probe should fail");
        assert!(!err.is_unreachable());
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_probe_surfaces_server_message() {
        let mock = MockOllama::spawn_with_tags_status(503, r#"{"error":"loading model"}"#).await;
        let client = OllamaClient::new(&mock.base_url(), "m").expect("client");
        let err = client.probe().await.expect_err("probe should fail");
        assert!(err.to_string().contains("loading model"));
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_send_chat_posts_model_and_stream_flag() {
        let mock = MockOllama::spawn(ChatScript::lines(vec![
            "{\"message\":{\"content\":\"x\"},\"done\":true}\n",
        ]))
        .await;
        let client = OllamaClient::new(&mock.base_url(), "phi3:3.8b").expect("client");
        let messages = vec![OutboundMessage::new(OutboundRole::User, "Hello")];
        let mut stream = client
            .send_chat(&messages)
            .await
            .expect("chat stream");

        let mut body = Vec::new();
        while let Ok(Some(chunk)) = stream.next_chunk().await {
            body.extend(chunk);
        }
        assert!(String::from_utf8_lossy(&body).contains("\"x\""));

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["model"], "phi3:3.8b");
        assert_eq!(requests[0]["stream"], true);
        assert_eq!(requests[0]["messages"][0]["role"], "user");
        assert_eq!(requests[0]["messages"][0]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_send_chat_error_status() {
        let mock = MockOllama::spawn(ChatScript::status(404, r#"{"error":"model 'nope' not found"}"#)).await;
        let client = OllamaClient::new(&mock.base_url(), "nope").expect("client");
        let err = client.send_chat(&[]).await.err().expect("chat should fail");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_abort_stops_reads() {
        let mock = MockOllama::spawn(ChatScript::hanging(vec![
            "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
        ]))
        .await;
        let client = OllamaClient::new(&mock.base_url(), "m").expect("client");
        let mut stream = client.send_chat(&[]).await.expect("chat stream");
        let first = stream.next_chunk().await;
        assert!(matches!(first, Ok(Some(_))));

        stream.abort();
        assert!(matches!(stream.next_chunk().await, Err(StreamError::Cancelled)));
    }
}
