//! Startup helpers for the drafter chat service.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::chat::core::config::ChatConfig;
use crate::chat::persistence::{HistoryStore, PersistedState, SqliteHistoryStore, spawn_autosave};
use crate::server::{self, AppState};

/// Run the service until Ctrl-C.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting drafter chat v{}", env!("CARGO_PKG_VERSION"));

    let config = ChatConfig::from_env();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(serve(config)) {
        tracing::error!("Server error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Open persisted history and build application state from it.
///
/// Unreadable history is logged and replaced by an empty state.
///
/// # Errors
/// Returns an error if the database cannot be opened or the configuration is invalid.
pub async fn initialize(
    config: ChatConfig,
) -> anyhow::Result<(Arc<AppState>, Arc<dyn HistoryStore>)> {
    config.validate().context("invalid configuration")?;

    let history = SqliteHistoryStore::open(&config.sqlite_path)
        .await
        .with_context(|| format!("opening {}", config.sqlite_path.display()))?;
    let persisted = history.load().await.unwrap_or_else(|e| {
        tracing::warn!("Failed to load saved history: {e}");
        PersistedState::default()
    });
    tracing::info!(
        "Loaded {} conversations from {}",
        persisted.conversations.len(),
        config.sqlite_path.display()
    );

    let state = AppState::new(config, persisted).await?;
    let history: Arc<dyn HistoryStore> = Arc::new(history);
    Ok((state, history))
}

/// Serve the API with autosave until Ctrl-C, then save once more.
///
/// # Errors
/// Returns an error if startup or the server fails.
pub async fn serve(config: ChatConfig) -> anyhow::Result<()> {
    let port = config.port;
    let (state, history) = initialize(config).await?;

    let shutdown = CancellationToken::new();
    let source = Arc::clone(&state);
    let autosave = spawn_autosave(
        history,
        state.events.subscribe(),
        move || {
            let source = Arc::clone(&source);
            async move { source.snapshot().await }
        },
        shutdown.clone(),
    );

    let signal = shutdown.clone();
    let result = server::run_server_with_shutdown(state, port, async move {
        tokio::select! {
            () = signal.cancelled() => {}
            received = tokio::signal::ctrl_c() => {
                if let Err(e) = received {
                    tracing::warn!("Failed to listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutdown requested");
            }
        }
    })
    .await;

    shutdown.cancel();
    if let Err(e) = autosave.await {
        tracing::warn!("Autosave task ended abnormally: {e}");
    }
    result
}
