//! Session controller: one cancellable generation per conversation.
//!
//! Lifecycle per conversation: `Idle -> Generating -> Idle`. A generation is
//! identified by a [`GenerationToken`] registered in a live table keyed by
//! conversation id. Every write into the conversation store first checks that
//! the writer's token is still the registered one, while holding the table
//! entry, so a cancelled or superseded stream can never clobber newer text.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::context_builder;
use crate::chat::core::config::DEFAULT_CONTEXT_LIMIT;
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::events::ChatEvent;
use crate::chat::core::ids::ConversationId;
use crate::chat::store::ConversationStore;
use crate::llm::errors::{ConnectError, StreamError};
use crate::llm::ollama_client::{OllamaClient, OutboundMessage};
use crate::llm::stream_decoder::{InferenceEvent, InferenceStream};

/// Identity of one generation attempt.
#[derive(Clone, Debug)]
struct GenerationToken {
    serial: u64,
    cancel: CancellationToken,
}

/// How a generation ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GenerationOutcome {
    /// The stream ended, with or without an explicit `Done` marker.
    Completed,
    /// The attempt failed; the contained text was written into the turn.
    Failed(String),
    /// The attempt was cancelled or superseded; nothing more was written.
    Cancelled,
}

/// Handle on a running generation.
#[derive(Debug)]
pub struct Generation {
    conversation_id: ConversationId,
    serial: u64,
    handle: JoinHandle<GenerationOutcome>,
}

impl Generation {
    /// Conversation the generation writes into.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Serial number of the generation's token.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Wait for the generation to end.
    pub async fn wait(self) -> GenerationOutcome {
        self.handle.await.unwrap_or_else(|err| {
            error!("generation task for {} failed: {err}", self.conversation_id);
            GenerationOutcome::Failed(err.to_string())
        })
    }
}

#[derive(Clone, Debug)]
struct SessionSettings {
    instruction_text: String,
    context_limit: usize,
}

/// Orchestrates generations against the conversation store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionController {
    store: Arc<ConversationStore>,
    client: Arc<RwLock<OllamaClient>>,
    settings: Arc<RwLock<SessionSettings>>,
    live: Arc<DashMap<ConversationId, GenerationToken>>,
    next_serial: Arc<AtomicU64>,
}

impl SessionController {
    /// Create a controller over `store` using `client` for transport.
    #[must_use]
    pub fn new(store: Arc<ConversationStore>, client: OllamaClient) -> Self {
        Self {
            store,
            client: Arc::new(RwLock::new(client)),
            settings: Arc::new(RwLock::new(SessionSettings {
                instruction_text: String::new(),
                context_limit: DEFAULT_CONTEXT_LIMIT,
            })),
            live: Arc::new(DashMap::new()),
            next_serial: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Conversation store driven by this controller.
    #[must_use]
    pub const fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    // ===== Configuration ====================================================

    /// Point the transport at a new endpoint.
    pub async fn set_endpoint(&self, base_url: &str) {
        self.client.write().await.set_base_url(base_url);
        self.store.events().publish(ChatEvent::SettingsChanged);
    }

    /// Switch the model used for future generations.
    pub async fn set_model(&self, model: &str) {
        self.client.write().await.set_model(model);
        self.store.events().publish(ChatEvent::SettingsChanged);
    }

    /// Current `(endpoint, model)` pair.
    pub async fn endpoint(&self) -> (String, String) {
        let client = self.client.read().await;
        (client.base_url().to_string(), client.model().to_string())
    }

    /// Set the system instruction sent with future generations.
    pub async fn set_persona_instruction(&self, text: &str) {
        self.settings.write().await.instruction_text = text.to_string();
    }

    #[cfg(test)]
    pub(crate) async fn persona_instruction(&self) -> String {
        self.settings.read().await.instruction_text.clone()
    }

    /// Set the number of most recent turns sent per generation.
    ///
    /// # Errors
    /// Returns [`ChatError::InvalidConfig`] if `limit` is zero.
    pub async fn set_context_limit(&self, limit: usize) -> ChatResult<()> {
        if limit == 0 {
            return Err(ChatError::InvalidConfig(
                "context_limit must be > 0".to_string(),
            ));
        }
        self.settings.write().await.context_limit = limit;
        Ok(())
    }

    /// Current context window, in turns.
    pub async fn context_limit(&self) -> usize {
        self.settings.read().await.context_limit
    }

    /// Probe the configured endpoint, or `candidate` if given, without
    /// changing the configuration.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] describing why the server is not usable.
    pub async fn test_connection(&self, candidate: Option<&str>) -> Result<(), ConnectError> {
        let client = self.client.read().await.clone();
        match candidate {
            Some(base_url) => client.probe_at(base_url).await,
            None => client.probe().await,
        }
    }

    // ===== Conversations ====================================================

    /// Create an empty conversation and make it active.
    #[must_use]
    pub fn new_conversation(&self) -> ConversationId {
        self.store.create(chrono::Utc::now().timestamp_millis())
    }

    /// Delete a conversation, cancelling its generation first.
    ///
    /// A generation started while the removal is in progress is cancelled
    /// too, so no token outlives its conversation.
    ///
    /// # Errors
    /// Returns [`ChatError::ConversationNotFound`] if `id` does not exist.
    pub fn delete_conversation(&self, id: &ConversationId) -> ChatResult<()> {
        self.cancel(id);
        let deleted = self.store.delete(id);
        self.cancel(id);
        deleted?;
        info!("deleted conversation {id}");
        Ok(())
    }

    /// Cancel every generation and remove every conversation.
    pub fn clear_all(&self) {
        self.cancel_all();
        self.store.clear();
        self.cancel_all();
        info!("cleared all conversations");
    }

    fn cancel_all(&self) {
        for id in self.generating() {
            self.cancel(&id);
        }
    }

    // ===== Generations ======================================================

    /// Whether a generation is in flight for `id`.
    #[must_use]
    pub fn is_generating(&self, id: &ConversationId) -> bool {
        self.live.contains_key(id)
    }

    /// Conversations with a generation in flight.
    #[must_use]
    pub fn generating(&self) -> Vec<ConversationId> {
        self.live.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send `user_text` into an existing conversation, or into a new one when
    /// `id` is `None`.
    ///
    /// # Errors
    /// See [`SessionController::start`].
    pub async fn start_or_create(
        &self,
        id: Option<ConversationId>,
        user_text: &str,
    ) -> ChatResult<Generation> {
        if user_text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let id = match id {
            Some(id) => id,
            None => self.new_conversation(),
        };
        self.start(id, user_text).await
    }

    /// Start a generation for `id`.
    ///
    /// Appends the user turn and an empty assistant placeholder, builds the
    /// outbound messages from the history prior to this call, and streams the
    /// answer into the placeholder on a background task.
    ///
    /// # Errors
    /// Returns [`ChatError::AlreadyGenerating`] if `id` already has a live
    /// generation, [`ChatError::EmptyMessage`] for blank input, and
    /// [`ChatError::ConversationNotFound`] for unknown ids.
    pub async fn start(&self, id: ConversationId, user_text: &str) -> ChatResult<Generation> {
        if user_text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let token = self.issue_token(&id)?;
        let prior = match self.store.append_exchange(&id, user_text) {
            Ok(prior) => prior,
            Err(err) => {
                self.live.remove_if(&id, |_, live| live.serial == token.serial);
                return Err(err);
            }
        };

        let settings = self.settings.read().await.clone();
        let messages = context_builder::build(
            &prior,
            settings.context_limit,
            user_text,
            &settings.instruction_text,
        );
        let client = self.client.read().await.clone();

        info!(
            conversation = %id,
            serial = token.serial,
            messages = messages.len(),
            model = client.model(),
            "generation started"
        );
        self.store.events().publish(ChatEvent::GenerationChanged {
            id: id.clone(),
            active: true,
        });

        let serial = token.serial;
        let this = self.clone();
        let task_id = id.clone();
        let handle =
            tokio::spawn(async move { this.drive(task_id, token, client, messages).await });

        Ok(Generation {
            conversation_id: id,
            serial,
            handle,
        })
    }

    /// Cancel the generation bound to `id`, if any.
    ///
    /// Local state becomes idle immediately; reads still in flight are
    /// discarded. Returns whether a generation was cancelled.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        let Some((_, token)) = self.live.remove(id) else {
            return false;
        };
        token.cancel.cancel();
        info!(conversation = %id, serial = token.serial, "generation cancelled");
        self.store.events().publish(ChatEvent::GenerationChanged {
            id: id.clone(),
            active: false,
        });
        true
    }

    fn issue_token(&self, id: &ConversationId) -> ChatResult<GenerationToken> {
        match self.live.entry(id.clone()) {
            Entry::Occupied(_) => Err(ChatError::AlreadyGenerating(id.clone())),
            Entry::Vacant(slot) => {
                let token = GenerationToken {
                    serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
                    cancel: CancellationToken::new(),
                };
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    /// Write `text` into the placeholder if `token` is still the live one.
    ///
    /// The live entry stays borrowed across the write so a concurrent cancel
    /// waits for it.
    #[allow(clippy::significant_drop_tightening)]
    fn apply(&self, id: &ConversationId, token: &GenerationToken, text: &str) -> bool {
        let Some(live) = self.live.get(id) else {
            return false;
        };
        if live.serial != token.serial {
            return false;
        }
        match self.store.update_last_turn(id, text) {
            Ok(updated) => updated,
            Err(err) => {
                warn!("dropping update for {id}: {err}");
                false
            }
        }
    }

    fn release(&self, id: &ConversationId, token: &GenerationToken) {
        if self
            .live
            .remove_if(id, |_, live| live.serial == token.serial)
            .is_some()
        {
            self.store.events().publish(ChatEvent::GenerationChanged {
                id: id.clone(),
                active: false,
            });
        }
    }

    async fn drive(
        self,
        id: ConversationId,
        token: GenerationToken,
        client: OllamaClient,
        messages: Vec<OutboundMessage>,
    ) -> GenerationOutcome {
        let sent = tokio::select! {
            biased;
            () = token.cancel.cancelled() => {
                self.release(&id, &token);
                return GenerationOutcome::Cancelled;
            }
            sent = client.send_chat_with(&messages, token.cancel.child_token()) => sent,
        };

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let text = connect_failure_text(&err, client.base_url());
                return self.fail(&id, &token, &err.to_string(), "", text);
            }
        };

        let mut events = InferenceStream::new(response);
        let mut last_text = String::new();
        loop {
            match events.next_event().await {
                Ok(Some(InferenceEvent::Content { cumulative_text })) => {
                    if !self.apply(&id, &token, &cumulative_text) {
                        events.abort();
                        self.release(&id, &token);
                        debug!(conversation = %id, serial = token.serial, "stale stream dropped");
                        return GenerationOutcome::Cancelled;
                    }
                    last_text = cumulative_text;
                }
                Ok(Some(InferenceEvent::Done) | None) => break,
                Err(StreamError::Cancelled) => {
                    self.release(&id, &token);
                    return GenerationOutcome::Cancelled;
                }
                Err(err) => {
                    let text = format!("Error: {err}");
                    return self.fail(&id, &token, &err.to_string(), &last_text, text);
                }
            }
        }

        self.release(&id, &token);
        info!(conversation = %id, serial = token.serial, chars = last_text.len(), "generation completed");
        GenerationOutcome::Completed
    }

    fn fail(
        &self,
        id: &ConversationId,
        token: &GenerationToken,
        detail: &str,
        partial: &str,
        message: String,
    ) -> GenerationOutcome {
        let text = if partial.is_empty() {
            message
        } else {
            format!("{partial}\n\n{message}")
        };

        if !self.apply(id, token, &text) {
            self.release(id, token);
            return GenerationOutcome::Cancelled;
        }
        self.release(id, token);
        error!(conversation = %id, serial = token.serial, "generation failed: {detail}");
        GenerationOutcome::Failed(text)
    }
}

fn connect_failure_text(err: &ConnectError, base_url: &str) -> String {
    if err.is_unreachable() {
        format!(
            "Error: could not connect to the inference server at {base_url}. \
             Make sure it is running and reachable, then try again."
        )
    } else {
        format!("Error: {err}")
    }
}
