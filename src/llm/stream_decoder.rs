//! Incremental decoder for the newline-delimited JSON chat stream.
//!
//! A single transport read may carry zero, one, partial, or several JSON
//! objects. The decoder buffers raw bytes across reads, only parses complete
//! lines, and keeps the trailing fragment for the next read. Buffering happens
//! before UTF-8 decoding, so a multi-byte character split across two reads is
//! reassembled intact.
//!
//! Emitted content is cumulative: every [`InferenceEvent::Content`] carries the
//! whole answer so far, not the fragment carried by the line.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::errors::{StreamError, StreamParseError};
use crate::llm::ollama_client::ResponseStream;

/// One decoded step of a generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InferenceEvent {
    /// Answer text so far, including everything emitted earlier in the stream.
    Content {
        /// Cumulative answer text.
        cumulative_text: String,
    },
    /// The server signalled normal completion.
    Done,
}

#[derive(Debug, Deserialize)]
struct WireLine {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

/// Stateful byte-to-event decoder. Pure: performs no I/O.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    text: String,
    finished: bool,
    server_error: Option<String>,
}

impl StreamDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk and return the events completed by it.
    ///
    /// Once a `Done` marker (or a server error line) has been seen, further
    /// input is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<InferenceEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.decode_line(&line, &mut events);
            if self.finished {
                self.pending.clear();
                break;
            }
        }
        events
    }

    /// Signal end of input and decode any unterminated trailing line.
    ///
    /// Reaching the end without a `Done` marker is not an error; the returned
    /// events simply do not contain one.
    pub fn finish(&mut self) -> Vec<InferenceEvent> {
        let mut events = Vec::new();
        if !self.finished {
            let rest = std::mem::take(&mut self.pending);
            self.decode_line(&rest, &mut events);
            self.finished = true;
        }
        events
    }

    /// Whether the decoder has stopped accepting input.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    fn text(&self) -> &str {
        &self.text
    }

    /// Take the error message reported by the server inside the stream, if any.
    pub const fn take_server_error(&mut self) -> Option<String> {
        self.server_error.take()
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<InferenceEvent>) {
        let line = raw.trim_ascii();
        if line.is_empty() {
            return;
        }

        let parsed: WireLine = match serde_json::from_slice(line) {
            Ok(parsed) => parsed,
            Err(source) => {
                let err = StreamParseError {
                    line: String::from_utf8_lossy(line).into_owned(),
                    source,
                };
                warn!("skipping stream line: {err}");
                return;
            }
        };

        if let Some(message) = parsed.error {
            self.server_error = Some(message);
            self.finished = true;
            return;
        }

        match parsed.message {
            Some(message) if !message.content.is_empty() => {
                self.text.push_str(&message.content);
                events.push(InferenceEvent::Content {
                    cumulative_text: self.text.clone(),
                });
            }
            Some(_) => {}
            None if !parsed.done => debug!("stream line without message content"),
            None => {}
        }

        if parsed.done {
            events.push(InferenceEvent::Done);
            self.finished = true;
        }
    }
}

/// Lazy, finite, non-restartable sequence of [`InferenceEvent`]s read from a
/// live chat response.
pub struct InferenceStream {
    response: ResponseStream,
    decoder: StreamDecoder,
    queue: VecDeque<InferenceEvent>,
    deferred: Option<StreamError>,
    exhausted: bool,
}

impl InferenceStream {
    /// Wrap a response handle.
    #[must_use]
    pub fn new(response: ResponseStream) -> Self {
        Self {
            response,
            decoder: StreamDecoder::new(),
            queue: VecDeque::new(),
            deferred: None,
            exhausted: false,
        }
    }

    /// Next decoded event, `Ok(None)` once the stream has ended.
    ///
    /// # Errors
    /// Returns a [`StreamError`] when the transport fails, the server reports
    /// an error line, or the stream is aborted.
    pub async fn next_event(&mut self) -> Result<Option<InferenceEvent>, StreamError> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if let Some(err) = self.deferred.take() {
                self.exhausted = true;
                return Err(err);
            }
            if self.exhausted || self.decoder.is_finished() {
                return Ok(None);
            }

            match self.response.next_chunk().await? {
                Some(chunk) => {
                    let events = self.decoder.push(&chunk);
                    self.queue.extend(events);
                }
                None => {
                    self.exhausted = true;
                    let events = self.decoder.finish();
                    self.queue.extend(events);
                }
            }

            if let Some(message) = self.decoder.take_server_error() {
                self.deferred = Some(StreamError::Server(message));
            }
        }
    }

    /// Abort the underlying response; no further events will be produced.
    pub fn abort(&mut self) {
        self.response.abort();
        self.queue.clear();
        self.exhausted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        "{\"model\":\"phi3\",\"created_at\":\"t\",\"message\":{\"role\":\"assistant\",\"content\":\"Bon\"},\"done\":false}\n",
        "{\"model\":\"phi3\",\"created_at\":\"t\",\"message\":{\"role\":\"assistant\",\"content\":\"jour \u{e9}t\u{e9} \"},\"done\":false}\n",
        "{\"model\":\"phi3\",\"created_at\":\"t\",\"message\":{\"role\":\"assistant\",\"content\":\"\u{1f600}!\"},\"done\":false}\n",
        "{\"model\":\"phi3\",\"created_at\":\"t\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
    );

    fn decode_all(chunks: &[&[u8]]) -> (Vec<InferenceEvent>, String) {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        let text = decoder.text().to_string();
        (events, text)
    }

    fn last_text(events: &[InferenceEvent]) -> Option<&str> {
        events.iter().rev().find_map(|event| match event {
            InferenceEvent::Content { cumulative_text } => Some(cumulative_text.as_str()),
            InferenceEvent::Done => None,
        })
    }

    #[test]
    fn test_cumulative_text_scenario() {
        let stream = concat!(
            "{\"message\":{\"content\":\"Hi\"},\"done\":false}\n",
            "{\"message\":{\"content\":\" there\"},\"done\":false}\n",
            "{\"done\":true}\n",
        );
        let (events, _) = decode_all(&[stream.as_bytes()]);
        assert_eq!(
            events,
            vec![
                InferenceEvent::Content {
                    cumulative_text: "Hi".to_string()
                },
                InferenceEvent::Content {
                    cumulative_text: "Hi there".to_string()
                },
                InferenceEvent::Done,
            ]
        );
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let bytes = SAMPLE.as_bytes();
        let (whole, whole_text) = decode_all(&[bytes]);
        assert_eq!(whole_text, "Bonjour \u{e9}t\u{e9} \u{1f600}!");

        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            let (events, text) = decode_all(&[head, tail]);
            assert_eq!(text, whole_text, "split at {split}");
            assert_eq!(last_text(&events), last_text(&whole), "split at {split}");
            assert_eq!(events.last(), Some(&InferenceEvent::Done));
        }

        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        let (events, text) = decode_all(&singles);
        assert_eq!(text, whole_text);
        assert_eq!(events, whole);
    }

    #[test]
    fn test_missing_done_ends_quietly() {
        let stream = "{\"message\":{\"content\":\"partial\"},\"done\":false}\n";
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(stream.as_bytes());
        assert_eq!(events.len(), 1);
        assert!(decoder.finish().is_empty());
        assert!(decoder.is_finished());
        assert_eq!(decoder.text(), "partial");
        assert!(decoder.take_server_error().is_none());
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let stream = concat!(
            "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
            "this is not json\n",
            "{\"message\":{\"content\":\"b\"},\"done\":false}\n",
        );
        let (events, text) = decode_all(&[stream.as_bytes()]);
        assert_eq!(text, "ab");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_input_after_done_is_discarded() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(b"{\"done\":true}\n{\"message\":{\"content\":\"late\"}}\n");
        assert_eq!(events, vec![InferenceEvent::Done]);
        assert!(decoder.push(b"{\"message\":{\"content\":\"later\"}}\n").is_empty());
        assert_eq!(decoder.text(), "");
    }

    #[test]
    fn test_unterminated_trailing_line_decoded_on_finish() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(b"{\"message\":{\"content\":\"tail\"}").is_empty());
        let events = decoder.push(b",\"done\":true}");
        assert!(events.is_empty());
        let events = decoder.finish();
        assert_eq!(
            events,
            vec![
                InferenceEvent::Content {
                    cumulative_text: "tail".to_string()
                },
                InferenceEvent::Done,
            ]
        );
    }

    #[test]
    fn test_server_error_line_stops_decoding() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(b"{\"message\":{\"content\":\"x\"}}\n{\"error\":\"model crashed\"}\n");
        assert_eq!(events.len(), 1);
        assert!(decoder.is_finished());
        assert_eq!(decoder.take_server_error().as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_blank_lines_and_crlf_are_ignored() {
        let stream = "\r\n\n{\"message\":{\"content\":\"ok\"},\"done\":false}\r\n\n";
        let (events, text) = decode_all(&[stream.as_bytes()]);
        assert_eq!(text, "ok");
        assert_eq!(events.len(), 1);
    }
}
