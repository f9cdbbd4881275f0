//! HTTP route handlers for the drafter chat API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::chat::core::errors::ChatError;
use crate::chat::core::ids::{ConversationId, PersonaId};
use crate::chat::core::types::{Conversation, Persona, Role};
use crate::llm::ollama_client::normalize_base_url;

use super::state::AppState;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/settings/test", post(test_settings))
        .route(
            "/api/conversations",
            get(list_conversations)
                .post(create_conversation)
                .delete(clear_conversations),
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/select", post(select_conversation))
        .route("/api/conversations/{id}/messages", post(send_message))
        .route("/api/conversations/{id}/cancel", post(cancel_generation))
        .route("/api/personas", get(get_personas).put(put_personas))
        .route("/api/personas/{id}/select", post(select_persona))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// Error body returned by every failing handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub error: String,
}

/// [`ChatError`] mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::AlreadyGenerating(_) => StatusCode::CONFLICT,
            ChatError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::EmptyMessage
            | ChatError::InvalidConfig(_)
            | ChatError::Serialization(_)
            | ChatError::Url(_) => StatusCode::BAD_REQUEST,
            ChatError::Connect(_) => StatusCode::BAD_GATEWAY,
            ChatError::Persistence(_) | ChatError::TokioSqlite(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "drafter-chat",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ===== Settings =============================================================

/// Current transport settings.
#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsView {
    /// Inference server base address.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Turns sent per generation.
    pub context_limit: usize,
}

/// Partial settings update.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    /// New base address.
    pub base_url: Option<String>,
    /// New model identifier.
    pub model: Option<String>,
    /// New context window.
    pub context_limit: Option<usize>,
}

/// Connection test request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionTest {
    /// Address to probe instead of the configured one.
    pub base_url: Option<String>,
}

/// Connection test result.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionReport {
    /// Whether the server answered successfully.
    pub ok: bool,
    /// Failure description, when not ok.
    pub error: Option<String>,
}

async fn settings_view(state: &AppState) -> SettingsView {
    let (base_url, model) = state.controller.endpoint().await;
    SettingsView {
        base_url,
        model,
        context_limit: state.controller.context_limit().await,
    }
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsView> {
    Json(settings_view(&state).await)
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<SettingsView>> {
    if let Some(base_url) = &update.base_url {
        url::Url::parse(&normalize_base_url(base_url)).map_err(ChatError::from)?;
    }
    if update.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return Err(ChatError::InvalidConfig("model must not be empty".to_string()).into());
    }
    if let Some(limit) = update.context_limit {
        state.controller.set_context_limit(limit).await?;
    }
    if let Some(base_url) = &update.base_url {
        state.controller.set_endpoint(base_url).await;
    }
    if let Some(model) = &update.model {
        state.controller.set_model(model).await;
    }
    Ok(Json(settings_view(&state).await))
}

async fn test_settings(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ConnectionReport>> {
    let request: ConnectionTest = parse_optional(&body)?;
    let candidate = request
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty());
    let report = match state.controller.test_connection(candidate).await {
        Ok(()) => ConnectionReport {
            ok: true,
            error: None,
        },
        Err(err) => ConnectionReport {
            ok: false,
            error: Some(err.to_string()),
        },
    };
    Ok(Json(report))
}

// ===== Conversations ========================================================

/// Sidebar entry for one conversation.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Title.
    pub title: String,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Number of turns.
    pub turn_count: usize,
    /// Whether a generation is in flight.
    pub generating: bool,
}

/// Every conversation plus the active one.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationList {
    /// Active conversation, if any.
    pub active: Option<ConversationId>,
    /// Conversations, newest first.
    pub conversations: Vec<ConversationSummary>,
}

/// One displayed turn.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnView {
    /// Author.
    pub role: Role,
    /// Text.
    pub text: String,
    /// Whether the turn falls outside the context window.
    pub out_of_context: bool,
}

/// Full view of one conversation.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationView {
    /// Conversation id.
    pub id: ConversationId,
    /// Title.
    pub title: String,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Whether a generation is in flight.
    pub generating: bool,
    /// Turns in order.
    pub messages: Vec<TurnView>,
}

/// Optional first message for a new conversation.
#[derive(Debug, Default, Deserialize)]
pub struct NewConversation {
    /// Message to send right away.
    pub text: Option<String>,
}

/// Message submission.
#[derive(Debug, Deserialize)]
pub struct SendMessage {
    /// User text.
    pub text: String,
}

/// Accepted generation.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationAccepted {
    /// Conversation the answer is streamed into.
    pub conversation_id: ConversationId,
    /// Generation serial, when one was started.
    pub serial: Option<u64>,
}

/// Cancellation result.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelReport {
    /// Whether a generation was running.
    pub cancelled: bool,
}

fn summary(state: &AppState, conversation: Conversation) -> ConversationSummary {
    ConversationSummary {
        generating: state.controller.is_generating(&conversation.id),
        turn_count: conversation.turns.len(),
        id: conversation.id,
        title: conversation.title,
        created_at: conversation.created_at,
    }
}

fn parse_optional<T>(body: &Bytes) -> Result<T, ChatError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Json<ConversationList> {
    let conversations = state
        .store()
        .list()
        .into_iter()
        .map(|c| summary(&state, c))
        .collect();
    Json(ConversationList {
        active: state.store().active(),
        conversations,
    })
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<GenerationAccepted>)> {
    let request: NewConversation = parse_optional(&body)?;
    let accepted = match request.text.filter(|t| !t.trim().is_empty()) {
        Some(text) => {
            let generation = state.controller.start_or_create(None, &text).await?;
            GenerationAccepted {
                conversation_id: generation.conversation_id().clone(),
                serial: Some(generation.serial()),
            }
        }
        None => GenerationAccepted {
            conversation_id: state.controller.new_conversation(),
            serial: None,
        },
    };
    Ok((StatusCode::CREATED, Json(accepted)))
}

async fn clear_conversations(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.clear_all();
    StatusCode::NO_CONTENT
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Json<ConversationView>> {
    let conversation = state
        .store()
        .get(&id)
        .ok_or_else(|| ChatError::ConversationNotFound(id.clone()))?;
    let window = state.controller.context_limit().await;
    let messages = conversation
        .turns
        .iter()
        .enumerate()
        .map(|(index, turn)| TurnView {
            role: turn.role,
            text: turn.text.clone(),
            out_of_context: conversation.is_out_of_context(index, window),
        })
        .collect();
    Ok(Json(ConversationView {
        generating: state.controller.is_generating(&id),
        id,
        title: conversation.title,
        created_at: conversation.created_at,
        messages,
    }))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state.controller.delete_conversation(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn select_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state.store().select(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Json(request): Json<SendMessage>,
) -> ApiResult<(StatusCode, Json<GenerationAccepted>)> {
    let generation = state.controller.start(id, &request.text).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(GenerationAccepted {
            conversation_id: generation.conversation_id().clone(),
            serial: Some(generation.serial()),
        }),
    ))
}

async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> Json<CancelReport> {
    Json(CancelReport {
        cancelled: state.controller.cancel(&id),
    })
}

// ===== Personas =============================================================

/// Persona list plus the active persona.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersonaList {
    /// Active persona id.
    pub active: PersonaId,
    /// Every persona, in display order.
    pub personas: Vec<Persona>,
}

async fn persona_list(state: &AppState) -> PersonaList {
    let book = state.personas.read().await;
    PersonaList {
        active: book.active().id.clone(),
        personas: book.list().to_vec(),
    }
}

async fn get_personas(State(state): State<Arc<AppState>>) -> Json<PersonaList> {
    Json(persona_list(&state).await)
}

async fn put_personas(
    State(state): State<Arc<AppState>>,
    Json(personas): Json<Vec<Persona>>,
) -> Json<PersonaList> {
    state.replace_personas(personas).await;
    Json(persona_list(&state).await)
}

async fn select_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PersonaId>,
) -> Json<Persona> {
    Json(state.select_persona(&id).await)
}

// ===== Events ===============================================================

async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, Infallible>(sse), receiver)),
                    Err(err) => warn!("dropping unencodable event: {err}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, {skipped} events skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
