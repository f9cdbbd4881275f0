//! In-process stand-in for an Ollama server, used by tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// How `/api/chat` answers.
#[derive(Clone, Debug)]
pub enum ChatScript {
    /// Stream these chunks, then close the body.
    Lines(Vec<String>),
    /// Stream these chunks, then stall forever.
    Hanging(Vec<String>),
    /// Answer with a status and body.
    Status(u16, String),
    /// Stream `before`, wait for `gate`, then stream `after` and close.
    Gated {
        before: Vec<String>,
        gate: Arc<Notify>,
        after: Vec<String>,
    },
}

impl ChatScript {
    pub fn lines<S: Into<String>>(chunks: Vec<S>) -> Self {
        Self::Lines(chunks.into_iter().map(Into::into).collect())
    }

    pub fn hanging<S: Into<String>>(chunks: Vec<S>) -> Self {
        Self::Hanging(chunks.into_iter().map(Into::into).collect())
    }

    pub fn status(code: u16, body: &str) -> Self {
        Self::Status(code, body.to_string())
    }

    pub fn gated<S: Into<String>>(before: Vec<S>, gate: &Arc<Notify>, after: Vec<S>) -> Self {
        Self::Gated {
            before: before.into_iter().map(Into::into).collect(),
            gate: Arc::clone(gate),
            after: after.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone)]
struct MockState {
    /// One script per chat request; the last one repeats.
    scripts: Arc<Vec<ChatScript>>,
    served: Arc<AtomicUsize>,
    tags_status: u16,
    tags_body: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

pub struct MockOllama {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockOllama {
    pub async fn spawn(script: ChatScript) -> Self {
        Self::spawn_sequence(vec![script]).await
    }

    /// Answer successive chat requests with successive scripts.
    pub async fn spawn_sequence(scripts: Vec<ChatScript>) -> Self {
        Self::spawn_inner(scripts, 200, r#"{"models":[]}"#.to_string()).await
    }

    pub async fn spawn_with_tags_status(status: u16, body: &str) -> Self {
        Self::spawn_inner(
            vec![ChatScript::lines(Vec::<String>::new())],
            status,
            body.to_string(),
        )
        .await
    }

    async fn spawn_inner(scripts: Vec<ChatScript>, tags_status: u16, tags_body: String) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            scripts: Arc::new(scripts),
            served: Arc::new(AtomicUsize::new(0)),
            tags_status,
            tags_body,
            requests: Arc::clone(&requests),
        };
        let app = Router::new()
            .route("/api/tags", get(tags))
            .route("/api/chat", post(chat))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// JSON bodies received on `/api/chat`, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Address of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);
    format!("http://{addr}")
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn tags(State(state): State<MockState>) -> Response {
    (status_code(state.tags_status), state.tags_body).into_response()
}

async fn chat(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    state
        .requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(body);

    let index = state.served.fetch_add(1, Ordering::SeqCst);
    let script = state
        .scripts
        .get(index.min(state.scripts.len().saturating_sub(1)))
        .cloned()
        .unwrap_or_else(|| ChatScript::lines(Vec::<String>::new()));

    match script {
        ChatScript::Lines(chunks) => {
            let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
            Body::from_stream(stream).into_response()
        }
        ChatScript::Hanging(chunks) => {
            let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>))
                .chain(futures::stream::pending());
            Body::from_stream(stream).into_response()
        }
        ChatScript::Status(code, body) => (status_code(code), body).into_response(),
        ChatScript::Gated {
            before,
            gate,
            after,
        } => {
            let head = futures::stream::iter(before.into_iter().map(Ok::<_, std::io::Error>));
            let tail = futures::stream::once(async move {
                gate.notified().await;
                futures::stream::iter(after.into_iter().map(Ok::<_, std::io::Error>))
            })
            .flatten();
            Body::from_stream(head.chain(tail)).into_response()
        }
    }
}
