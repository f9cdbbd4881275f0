//! Application state shared across all request handlers.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::chat::core::config::ChatConfig;
use crate::chat::core::errors::ChatResult;
use crate::chat::core::events::{ChatEvent, EventBus};
use crate::chat::core::ids::PersonaId;
use crate::chat::core::types::Persona;
use crate::chat::persistence::PersistedState;
use crate::chat::personas::PersonaBook;
use crate::chat::session::SessionController;
use crate::chat::store::ConversationStore;
use crate::llm::ollama_client::OllamaClient;

/// Shared application state.
pub struct AppState {
    /// Generation orchestrator; also owns the conversation store.
    pub controller: SessionController,
    /// Persona list and active persona.
    pub personas: RwLock<PersonaBook>,
    /// Change notifications.
    pub events: EventBus,
    /// Startup configuration.
    pub config: ChatConfig,
}

impl AppState {
    /// Assemble state from configuration and whatever was persisted.
    ///
    /// Persisted endpoint and model take precedence over `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub async fn new(config: ChatConfig, persisted: PersistedState) -> ChatResult<Arc<Self>> {
        config.validate()?;

        let base_url = persisted.base_url.as_deref().unwrap_or(&config.base_url);
        let model = persisted.model.as_deref().unwrap_or(&config.model);
        let client = OllamaClient::new(base_url, model)?;
        info!("inference endpoint: {} (model {})", client.base_url(), client.model());

        let events = EventBus::new();
        let store = Arc::new(ConversationStore::with_conversations(
            events.clone(),
            persisted.conversations,
        ));
        let controller = SessionController::new(store, client);
        controller.set_context_limit(config.context_limit).await?;

        let personas = PersonaBook::new(persisted.personas.unwrap_or_default());
        controller
            .set_persona_instruction(&personas.active().instruction_text)
            .await;

        Ok(Arc::new(Self {
            controller,
            personas: RwLock::new(personas),
            events,
            config,
        }))
    }

    /// Conversation store.
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        self.controller.store()
    }

    /// Activate a persona and push its instruction into the controller.
    pub async fn select_persona(&self, id: &PersonaId) -> Persona {
        let mut book = self.personas.write().await;
        let active = book.select(id).clone();
        self.persona_changed(&active).await;
        active
    }

    /// Replace the persona list and push the resulting instruction.
    pub async fn replace_personas(&self, personas: Vec<Persona>) -> Persona {
        let mut book = self.personas.write().await;
        let active = book.replace_all(personas).clone();
        self.persona_changed(&active).await;
        active
    }

    async fn persona_changed(&self, active: &Persona) {
        self.controller
            .set_persona_instruction(&active.instruction_text)
            .await;
        self.events.publish(ChatEvent::PersonasChanged {
            active: active.id.clone(),
        });
    }

    /// Snapshot of everything the persistence layer keeps.
    pub async fn snapshot(&self) -> PersistedState {
        let (base_url, model) = self.controller.endpoint().await;
        PersistedState {
            conversations: self.store().list(),
            base_url: Some(base_url),
            model: Some(model),
            personas: Some(self.personas.read().await.list().to_vec()),
        }
    }
}
