//! Binary entrypoint that launches the drafter chat service.

use std::process::ExitCode;

use drafter_chat::start_drafter_chat;

/// Load configuration and history, then serve the chat API until interrupted.
fn main() -> ExitCode {
    start_drafter_chat::run()
}
