//! Per-session accumulation of assistant text with a byte ceiling.

use serde::Serialize;

/// Assistant text accumulated for one vendor session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccumulatedText {
    pub text: String,
    /// Sticky: once set it stays set for the life of the parser.
    pub truncated: bool,
}

/// What happened when new text was merged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeOutcome {
    /// Byte length of the merged text before truncation.
    pub merged_bytes: usize,
    /// This update is the first one to truncate the session's text.
    pub first_truncation: bool,
}

impl AccumulatedText {
    /// Merge `incoming` into the accumulated text, then enforce `max_bytes`.
    pub(crate) fn update(&mut self, incoming: &str, max_bytes: usize) -> MergeOutcome {
        let merged = merge_text(&self.text, incoming);
        let merged_bytes = merged.len();

        let mut first_truncation = false;
        if merged_bytes > max_bytes {
            self.text = truncate_to_char_boundary(&merged, max_bytes).to_string();
            first_truncation = !self.truncated;
            self.truncated = true;
        } else {
            self.text = merged;
        }

        MergeOutcome {
            merged_bytes,
            first_truncation,
        }
    }
}

/// Merge vendor text that may arrive either as deltas or as the full text
/// so far.
///
/// If the incoming text extends what we have, it is a full snapshot and
/// replaces it. If what we have already starts or ends with the incoming
/// text, it is a replay and adds nothing. Otherwise it is a delta and is
/// appended.
pub(crate) fn merge_text(existing: &str, incoming: &str) -> String {
    if existing.is_empty() {
        return incoming.to_string();
    }
    if incoming.starts_with(existing) {
        return incoming.to_string();
    }
    if existing.starts_with(incoming) || existing.ends_with(incoming) {
        return existing.to_string();
    }
    let mut merged = String::with_capacity(existing.len() + incoming.len());
    merged.push_str(existing);
    merged.push_str(incoming);
    merged
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a
/// code point.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
