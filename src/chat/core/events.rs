//! Change notifications published by the chat core.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::chat::core::ids::{ConversationId, PersonaId};

/// Buffered notifications per subscriber before it starts lagging.
pub const EVENT_CAPACITY: usize = 256;

/// A change observed by presentation and persistence collaborators.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A conversation was created.
    ConversationCreated {
        /// Conversation id.
        id: ConversationId,
    },
    /// A conversation was removed.
    ConversationDeleted {
        /// Conversation id.
        id: ConversationId,
    },
    /// The active conversation changed.
    ConversationSelected {
        /// Newly active conversation, if any.
        id: Option<ConversationId>,
    },
    /// A user turn and its assistant placeholder were appended.
    TurnsAppended {
        /// Conversation id.
        id: ConversationId,
    },
    /// The last turn's text was replaced.
    TurnUpdated {
        /// Conversation id.
        id: ConversationId,
        /// New full text of the turn.
        text: String,
    },
    /// A title was derived from the first user turn.
    TitleAssigned {
        /// Conversation id.
        id: ConversationId,
        /// Assigned title.
        title: String,
    },
    /// A generation started or ended.
    GenerationChanged {
        /// Conversation id.
        id: ConversationId,
        /// Whether a generation is now in flight.
        active: bool,
    },
    /// Every conversation was removed.
    HistoryCleared,
    /// The persona list or the active persona changed.
    PersonasChanged {
        /// Active persona.
        active: PersonaId,
    },
    /// Endpoint or model changed.
    SettingsChanged,
}

/// Cloneable fan-out channel for [`ChatEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ChatEvent) {
        trace!(?event, "publish");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ChatEvent::GenerationChanged {
            id: ConversationId::from_raw("chat-1"),
            active: true,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "generation_changed");
        assert_eq!(json["id"], "chat-1");
        assert_eq!(json["active"], true);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(ChatEvent::HistoryCleared);

        let mut rx = bus.subscribe();
        bus.publish(ChatEvent::SettingsChanged);
        assert_eq!(rx.recv().await.ok(), Some(ChatEvent::SettingsChanged));
    }
}
