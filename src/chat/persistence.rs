//! Durable history, settings, and personas.
//!
//! Values are kept in a small key/value table, one JSON document per key,
//! under the same keys the browser build of the app used.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::core::errors::ChatResult;
use crate::chat::core::events::ChatEvent;
use crate::chat::core::types::{Conversation, Persona};

/// Boxed future type for history store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key holding the conversation list.
pub const HISTORY_KEY: &str = "assistantDrafterChatsHistory_ollama";
/// Key holding the inference server address.
pub const URL_KEY: &str = "assistantDrafterOllamaUrl";
/// Key holding the model identifier.
pub const MODEL_KEY: &str = "assistantDrafterOllamaModel";
/// Key holding the persona list.
pub const PERSONAS_KEY: &str = "assistantDrafterPersonas";

/// Quiet period used to coalesce bursts of changes into one save.
pub const AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Everything that survives a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Conversations, newest first.
    pub conversations: Vec<Conversation>,
    /// Saved inference server address.
    pub base_url: Option<String>,
    /// Saved model identifier.
    pub model: Option<String>,
    /// Saved persona list.
    pub personas: Option<Vec<Persona>>,
}

/// Durable storage for [`PersistedState`].
pub trait HistoryStore: Send + Sync {
    /// Load whatever was saved. Missing or unreadable values come back empty.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn load(&self) -> StoreFuture<'_, ChatResult<PersistedState>>;

    /// Save a full snapshot. An empty conversation list removes the history.
    ///
    /// # Errors
    /// Returns an error if storage access or serialization fails.
    fn save(&self, state: &PersistedState) -> StoreFuture<'_, ChatResult<()>>;
}

/// `SQLite` implementation of [`HistoryStore`].
pub struct SqliteHistoryStore {
    conn: Arc<Connection>,
    table: String,
}

impl SqliteHistoryStore {
    /// Table name for saved values.
    pub const DEFAULT_TABLE: &'static str = "app_state";

    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> ChatResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::new(Arc::new(conn)).await
    }

    /// Initialize the store on an open connection.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    pub async fn new(conn: Arc<Connection>) -> ChatResult<Self> {
        let table = Self::DEFAULT_TABLE.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }

    async fn read_all(&self) -> ChatResult<Vec<(String, String)>> {
        let table = self.table.clone();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT key, value FROM {table}"))?;
                let rows: Vec<(String, String)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    #[cfg(test)]
    async fn raw(&self, key: &str) -> ChatResult<Option<String>> {
        use rusqlite::OptionalExtension;

        let table = self.table.clone();
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn| {
                let value: Option<String> = conn
                    .query_row(
                        &format!("SELECT value FROM {table} WHERE key = ?1"),
                        rusqlite::params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn load(&self) -> StoreFuture<'_, ChatResult<PersistedState>> {
        Box::pin(async move {
            let mut state = PersistedState::default();
            for (key, value) in self.read_all().await? {
                match key.as_str() {
                    HISTORY_KEY => match serde_json::from_str(&value) {
                        Ok(conversations) => state.conversations = conversations,
                        Err(err) => warn!("ignoring unreadable conversation history: {err}"),
                    },
                    PERSONAS_KEY => match serde_json::from_str(&value) {
                        Ok(personas) => state.personas = Some(personas),
                        Err(err) => warn!("ignoring unreadable personas: {err}"),
                    },
                    URL_KEY => state.base_url = Some(value).filter(|v| !v.trim().is_empty()),
                    MODEL_KEY => state.model = Some(value).filter(|v| !v.trim().is_empty()),
                    other => debug!("skipping unknown key {other}"),
                }
            }
            state
                .conversations
                .sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(state)
        })
    }

    fn save(&self, state: &PersistedState) -> StoreFuture<'_, ChatResult<()>> {
        let state = state.clone();
        Box::pin(async move {
            let table = self.table.clone();
            let now = chrono::Utc::now().timestamp_millis();

            let mut writes: Vec<(&'static str, String)> = Vec::with_capacity(4);
            let history = if state.conversations.is_empty() {
                None
            } else {
                let mut sorted = state.conversations;
                sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Some(serde_json::to_string(&sorted)?)
            };
            if let Some(url) = state.base_url {
                writes.push((URL_KEY, url));
            }
            if let Some(model) = state.model {
                writes.push((MODEL_KEY, model));
            }
            if let Some(personas) = state.personas {
                writes.push((PERSONAS_KEY, serde_json::to_string(&personas)?));
            }

            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let upsert = format!(
                        "INSERT OR REPLACE INTO {table} (key, value, updated_at) VALUES (?1, ?2, ?3)"
                    );
                    match history {
                        Some(json) => {
                            tx.execute(&upsert, rusqlite::params![HISTORY_KEY, json, now])?;
                        }
                        None => {
                            tx.execute(
                                &format!("DELETE FROM {table} WHERE key = ?1"),
                                rusqlite::params![HISTORY_KEY],
                            )?;
                        }
                    }
                    for (key, value) in writes {
                        tx.execute(&upsert, rusqlite::params![key, value, now])?;
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;

            Ok(())
        })
    }
}

/// Save a fresh snapshot whenever chat state changes.
///
/// Bursts of events (streamed text, for instance) are coalesced: after the
/// first event the task waits [`AUTOSAVE_DEBOUNCE`], drains whatever else
/// arrived, then saves once. A final save runs on shutdown.
pub fn spawn_autosave<F, Fut>(
    history: Arc<dyn HistoryStore>,
    mut events: broadcast::Receiver<ChatEvent>,
    snapshot: F,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = PersistedState> + Send,
{
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }

            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(AUTOSAVE_DEBOUNCE) => {}
            }
            let mut drained = 0_usize;
            while events.try_recv().is_ok() {
                drained += 1;
            }

            let state = snapshot().await;
            match history.save(&state).await {
                Ok(()) => debug!(
                    conversations = state.conversations.len(),
                    coalesced = drained,
                    "autosaved"
                ),
                Err(err) => warn!("autosave failed: {err}"),
            }
        }

        let state = snapshot().await;
        if let Err(err) = history.save(&state).await {
            warn!("final save failed: {err}");
        } else {
            info!("history saved on shutdown");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::core::events::EventBus;
    use crate::chat::core::ids::{ConversationId, PersonaId};
    use crate::chat::core::types::Turn;
    use crate::chat::store::ConversationStore;

    async fn memory_store() -> SqliteHistoryStore {
        let conn = Connection::open_in_memory().await.expect("open");
        SqliteHistoryStore::new(Arc::new(conn)).await.expect("init")
    }

    fn conversation(id: &str, created_at: i64) -> Conversation {
        let mut conversation = Conversation::new(ConversationId::from_raw(id), created_at);
        conversation.title = "Hello".to_string();
        conversation.turns = vec![Turn::user("Hello"), Turn::assistant("Hi there")];
        conversation
    }

    #[tokio::test]
    async fn test_empty_database_loads_defaults() {
        let store = memory_store().await;
        assert_eq!(store.load().await.expect("load"), PersistedState::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = memory_store().await;
        let state = PersistedState {
            conversations: vec![conversation("chat-1", 1), conversation("chat-2", 2)],
            base_url: Some("http://gpu-box:11434".to_string()),
            model: Some("llama3:8b".to_string()),
            personas: Some(vec![Persona {
                id: PersonaId::from_raw("p"),
                name: "P".to_string(),
                instruction_text: "Be brief.".to_string(),
                input_hint: "Ask".to_string(),
            }]),
        };
        store.save(&state).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.conversations[0].id.as_str(), "chat-2");
        assert_eq!(loaded.conversations[1], state.conversations[0]);
        assert_eq!(loaded.base_url, state.base_url);
        assert_eq!(loaded.personas, state.personas);
    }

    #[tokio::test]
    async fn test_stored_layout_matches_browser_format() {
        let store = memory_store().await;
        let state = PersistedState {
            conversations: vec![conversation("chat-1", 5)],
            base_url: Some("http://localhost:11434".to_string()),
            ..PersistedState::default()
        };
        store.save(&state).await.expect("save");

        assert_eq!(
            store.raw(URL_KEY).await.expect("raw").as_deref(),
            Some("http://localhost:11434")
        );
        let history = store.raw(HISTORY_KEY).await.expect("raw").expect("history");
        let json: serde_json::Value = serde_json::from_str(&history).expect("json");
        assert_eq!(json[0]["createdAt"], 5);
        assert_eq!(json[0]["messages"][1]["role"], "model");
        assert_eq!(json[0]["messages"][1]["text"], "Hi there");
    }

    #[tokio::test]
    async fn test_empty_history_removes_the_key() {
        let store = memory_store().await;
        let mut state = PersistedState {
            conversations: vec![conversation("chat-1", 1)],
            model: Some("phi3:3.8b".to_string()),
            ..PersistedState::default()
        };
        store.save(&state).await.expect("save");
        assert!(store.raw(HISTORY_KEY).await.expect("raw").is_some());

        state.conversations.clear();
        store.save(&state).await.expect("save");
        assert!(store.raw(HISTORY_KEY).await.expect("raw").is_none());
        assert_eq!(store.raw(MODEL_KEY).await.expect("raw").as_deref(), Some("phi3:3.8b"));
        assert!(store.load().await.expect("load").conversations.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_history_is_ignored() {
        let store = memory_store().await;
        let table = store.table.clone();
        store
            .conn
            .call(move |conn| {
                conn.execute(
                    &format!("INSERT INTO {table} (key, value, updated_at) VALUES (?1, ?2, 0)"),
                    rusqlite::params![HISTORY_KEY, "{not json"],
                )?;
                Ok(())
            })
            .await
            .expect("insert");
        assert!(store.load().await.expect("load").conversations.is_empty());
    }

    #[tokio::test]
    async fn test_autosave_follows_store_changes() {
        let history: Arc<dyn HistoryStore> = Arc::new(memory_store().await);
        let bus = EventBus::new();
        let store = Arc::new(ConversationStore::new(bus.clone()));
        let shutdown = CancellationToken::new();

        let source = Arc::clone(&store);
        let task = spawn_autosave(
            Arc::clone(&history),
            bus.subscribe(),
            move || {
                let source = Arc::clone(&source);
                async move {
                    PersistedState {
                        conversations: source.list(),
                        ..PersistedState::default()
                    }
                }
            },
            shutdown.clone(),
        );

        let id = store.create(1);
        store.append_exchange(&id, "Hello").expect("append");
        store.update_last_turn(&id, "Hi").expect("update");

        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = history.load().await.expect("load");
                if state.conversations.first().is_some_and(|c| c.turns.len() == 2) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("autosave never ran");
        assert_eq!(saved.conversations[0].title, "Hello");

        shutdown.cancel();
        task.await.expect("join");
    }
}
