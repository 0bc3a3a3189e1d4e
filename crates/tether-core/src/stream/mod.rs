//! NDJSON framing for the vendor CLI's stdout.
//!
//! [`StreamParser`] accepts raw byte chunks in whatever sizes the pipe
//! delivers them, splits them into lines, validates each line against the
//! [`StreamEvent`] union and queues the valid ones. Bad lines are counted
//! and reported to an optional [`ParserObserver`]; they never stop the
//! stream.
//!
//! ```text
//! stdout bytes --push_chunk--> line buffer --split \n--> decode --> validate
//!                                                                     |
//!                     drain_events() <-- pending queue <--------------+
//!                                             |
//!                                  assistant text accumulation
//! ```

pub mod accumulate;
pub mod event;

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::config::ParserConfig;

pub use accumulate::AccumulatedText;
pub use event::{ContentBlock, StreamEvent, ToolKind, ToolPayload, concat_text};

/// Counts produced by one [`StreamParser::push_chunk`] or
/// [`StreamParser::end`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushResult {
    pub parsed_count: usize,
    pub malformed_line_count: usize,
    pub invalid_event_count: usize,
    /// The pending queue is at or above the high watermark; the caller
    /// should stop feeding bytes until it drains.
    pub should_pause: bool,
}

impl PushResult {
    /// Fold another call's counts into this one.
    pub fn absorb(&mut self, other: PushResult) {
        self.parsed_count += other.parsed_count;
        self.malformed_line_count += other.malformed_line_count;
        self.invalid_event_count += other.invalid_event_count;
        self.should_pause = other.should_pause;
    }

    pub fn has_issues(&self) -> bool {
        self.malformed_line_count > 0 || self.invalid_event_count > 0
    }
}

/// Callbacks for lines the parser could not use and for text truncation.
///
/// Every method has a no-op default so observers implement only what they
/// care about.
pub trait ParserObserver: Send {
    /// The line was not valid JSON.
    fn malformed_line(&mut self, _line: &str, _error: &serde_json::Error) {}

    /// The line was JSON but did not match any known event shape.
    fn invalid_event(&mut self, _line: &str, _error: &serde_json::Error) {}

    /// A session's accumulated text was truncated for the first time.
    fn text_truncated(&mut self, _session_id: &str, _original_bytes: usize) {}
}

/// Incremental parser for one prompt invocation.
pub struct StreamParser {
    config: ParserConfig,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    accumulated: HashMap<String, AccumulatedText>,
    observer: Option<Box<dyn ParserObserver>>,
}

impl std::fmt::Debug for StreamParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParser")
            .field("buffered_bytes", &self.buffer.len())
            .field("pending", &self.pending.len())
            .field("sessions", &self.accumulated.len())
            .finish()
    }
}

impl StreamParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            accumulated: HashMap::new(),
            observer: None,
        }
    }

    pub fn with_observer(config: ParserConfig, observer: Box<dyn ParserObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(config)
        }
    }

    /// Append bytes and parse every complete line they finish.
    ///
    /// An incomplete trailing fragment stays buffered for the next call.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> PushResult {
        let mut result = PushResult::default();
        self.buffer.extend_from_slice(chunk);

        if let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') {
            let rest = self.buffer.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.buffer, rest);
            for line in complete.split(|&b| b == b'\n') {
                self.process_line(line, &mut result);
            }
        }

        result.should_pause = self.is_backpressured();
        result
    }

    /// Parse whatever is left in the buffer as a final, unterminated line.
    pub fn end(&mut self) -> PushResult {
        let mut result = PushResult::default();
        let rest = std::mem::take(&mut self.buffer);
        self.process_line(&rest, &mut result);
        result.should_pause = self.is_backpressured();
        result
    }

    /// Remove and return every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        self.pending.drain(..).collect()
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_backpressured(&self) -> bool {
        self.pending.len() >= self.config.backpressure_high_watermark
    }

    pub fn accumulated_text(&self, session_id: &str) -> Option<&AccumulatedText> {
        self.accumulated.get(session_id)
    }

    fn process_line(&mut self, raw: &[u8], result: &mut PushResult) {
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let value: serde_json::Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                result.malformed_line_count += 1;
                let text = String::from_utf8_lossy(line);
                debug!(line = %text, error = %e, "skipping malformed stream line");
                if let Some(observer) = self.observer.as_mut() {
                    observer.malformed_line(&text, &e);
                }
                return;
            }
        };

        let event = match StreamEvent::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                result.invalid_event_count += 1;
                let text = String::from_utf8_lossy(line);
                debug!(line = %text, error = %e, "skipping stream line that matches no event");
                if let Some(observer) = self.observer.as_mut() {
                    observer.invalid_event(&text, &e);
                }
                return;
            }
        };

        if let StreamEvent::AssistantMessage {
            session_id,
            content,
        } = &event
        {
            self.accumulate(session_id, &concat_text(content));
        }

        self.pending.push_back(event);
        result.parsed_count += 1;
    }

    fn accumulate(&mut self, session_id: &str, text: &str) {
        let max = self.config.max_accumulated_text_bytes;
        let entry = self.accumulated.entry(session_id.to_string()).or_default();
        let outcome = entry.update(text, max);
        if outcome.first_truncation {
            warn!(
                session_id,
                original_bytes = outcome.merged_bytes,
                max_bytes = max,
                "accumulated assistant text truncated"
            );
            if let Some(observer) = self.observer.as_mut() {
                observer.text_truncated(session_id, outcome.merged_bytes);
            }
        }
    }
}
