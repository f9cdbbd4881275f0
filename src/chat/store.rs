//! In-memory conversation store.
//!
//! The store is the only owner of conversation state. Every mutation is a
//! read-modify-write keyed by conversation id under one lock, so a streamed
//! update racing a structural edit (new chat, delete, clear) can never write
//! into a stale copy. No lock is held across an `.await`.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::events::{ChatEvent, EventBus};
use crate::chat::core::ids::ConversationId;
use crate::chat::core::types::{Conversation, Role, Turn, derive_title};

#[derive(Debug, Default)]
struct StoreState {
    /// Newest first.
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
}

impl StoreState {
    fn find(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn find_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }
}

/// Mutation authority for the set of conversations.
#[derive(Debug)]
pub struct ConversationStore {
    state: RwLock<StoreState>,
    events: EventBus,
}

impl ConversationStore {
    /// Create an empty store publishing on `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self::with_conversations(events, Vec::new())
    }

    /// Create a store from loaded history. The newest conversation becomes active.
    #[must_use]
    pub fn with_conversations(events: EventBus, mut conversations: Vec<Conversation>) -> Self {
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let active = conversations.first().map(|c| c.id.clone());
        Self {
            state: RwLock::new(StoreState {
                conversations,
                active,
            }),
            events,
        }
    }

    /// Notification bus this store publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty conversation, put it first, and make it active.
    pub fn create(&self, now_ms: i64) -> ConversationId {
        let id = ConversationId::new();
        {
            let mut state = self.write();
            state
                .conversations
                .insert(0, Conversation::new(id.clone(), now_ms));
            state.active = Some(id.clone());
        }
        debug!("created conversation {id}");
        self.events
            .publish(ChatEvent::ConversationCreated { id: id.clone() });
        self.events.publish(ChatEvent::ConversationSelected {
            id: Some(id.clone()),
        });
        id
    }

    /// Make `id` the active conversation.
    ///
    /// # Errors
    /// Returns [`ChatError::ConversationNotFound`] if `id` does not exist.
    pub fn select(&self, id: &ConversationId) -> ChatResult<()> {
        {
            let mut state = self.write();
            if state.find(id).is_none() {
                return Err(ChatError::ConversationNotFound(id.clone()));
            }
            state.active = Some(id.clone());
        }
        self.events
            .publish(ChatEvent::ConversationSelected { id: Some(id.clone()) });
        Ok(())
    }

    /// Currently active conversation.
    #[must_use]
    pub fn active(&self) -> Option<ConversationId> {
        self.read().active.clone()
    }

    /// Remove a conversation. If it was active, the newest remaining one
    /// becomes active.
    ///
    /// # Errors
    /// Returns [`ChatError::ConversationNotFound`] if `id` does not exist.
    pub(crate) fn delete(&self, id: &ConversationId) -> ChatResult<Conversation> {
        let (removed, new_active) = {
            let mut state = self.write();
            let index = state
                .conversations
                .iter()
                .position(|c| &c.id == id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.clone()))?;
            let removed = state.conversations.remove(index);
            let new_active = if state.active.as_ref() == Some(id) {
                state.active = state.conversations.first().map(|c| c.id.clone());
                Some(state.active.clone())
            } else {
                None
            };
            (removed, new_active)
        };

        self.events
            .publish(ChatEvent::ConversationDeleted { id: id.clone() });
        if let Some(active) = new_active {
            self.events
                .publish(ChatEvent::ConversationSelected { id: active });
        }
        Ok(removed)
    }

    /// Remove every conversation.
    pub(crate) fn clear(&self) {
        {
            let mut state = self.write();
            state.conversations.clear();
            state.active = None;
        }
        self.events.publish(ChatEvent::HistoryCleared);
    }

    /// Whether `id` exists.
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.read().find(id).is_some()
    }

    /// Copy of one conversation.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.read().find(id).cloned()
    }

    /// Copy of every conversation, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<Conversation> {
        self.read().conversations.clone()
    }

    /// Append a user turn and an empty assistant placeholder in one step.
    ///
    /// The first user turn of a conversation also sets its title. Returns the
    /// turns as they were before this call.
    ///
    /// # Errors
    /// Returns [`ChatError::ConversationNotFound`] if `id` does not exist.
    pub fn append_exchange(&self, id: &ConversationId, user_text: &str) -> ChatResult<Vec<Turn>> {
        let (prior, title) = {
            let mut state = self.write();
            let conversation = state
                .find_mut(id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.clone()))?;
            let prior = conversation.turns.clone();
            let title = if prior.is_empty() {
                conversation.title = derive_title(user_text);
                Some(conversation.title.clone())
            } else {
                None
            };
            conversation.turns.push(Turn::user(user_text));
            conversation.turns.push(Turn::placeholder());
            (prior, title)
        };

        if let Some(title) = title {
            self.events.publish(ChatEvent::TitleAssigned {
                id: id.clone(),
                title,
            });
        }
        self.events
            .publish(ChatEvent::TurnsAppended { id: id.clone() });
        Ok(prior)
    }

    /// Replace the text of the trailing assistant turn.
    ///
    /// Returns `false` when the last turn is not an assistant turn.
    ///
    /// # Errors
    /// Returns [`ChatError::ConversationNotFound`] if `id` does not exist.
    pub fn update_last_turn(&self, id: &ConversationId, text: &str) -> ChatResult<bool> {
        {
            let mut state = self.write();
            let conversation = state
                .find_mut(id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.clone()))?;
            match conversation.turns.last_mut() {
                Some(turn) if turn.role == Role::Assistant => {
                    if turn.text == text {
                        return Ok(true);
                    }
                    turn.text.clear();
                    turn.text.push_str(text);
                }
                _ => {
                    warn!("conversation {id} has no trailing assistant turn to update");
                    return Ok(false);
                }
            }
        }

        self.events.publish(ChatEvent::TurnUpdated {
            id: id.clone(),
            text: text.to_string(),
        });
        Ok(true)
    }
}
