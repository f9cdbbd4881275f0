//! Builds the exact message list sent for one generation.

use crate::chat::core::types::Turn;
use crate::llm::ollama_client::{OutboundMessage, OutboundRole};

/// Assemble the outbound messages for a generation.
///
/// Order of operations:
/// 1. `pending_user_text` is appended to a copy of `full_history` as a user
///    turn (skipped when empty, for callers whose history already holds it).
/// 2. Only the most recent `window_limit` turns are kept.
/// 3. Empty assistant turns at the tail are dropped.
/// 4. A system message is prepended when `instruction_text` is not blank.
#[must_use]
pub fn build(
    full_history: &[Turn],
    window_limit: usize,
    pending_user_text: &str,
    instruction_text: &str,
) -> Vec<OutboundMessage> {
    let pending = (!pending_user_text.is_empty()).then(|| Turn::user(pending_user_text));
    let mut working: Vec<&Turn> = full_history.iter().collect();
    if let Some(turn) = pending.as_ref() {
        working.push(turn);
    }

    let skip = working.len().saturating_sub(window_limit);
    let mut windowed = working.split_off(skip);

    while windowed.last().is_some_and(|turn| turn.is_empty_assistant()) {
        windowed.pop();
    }

    let mut out = Vec::with_capacity(windowed.len() + 1);
    if !instruction_text.trim().is_empty() {
        out.push(OutboundMessage::new(OutboundRole::System, instruction_text));
    }
    out.extend(
        windowed
            .into_iter()
            .map(|turn| OutboundMessage::new(turn.role.outbound(), turn.text.clone())),
    );
    out
}
