//! Translation of vendor [`StreamEvent`]s into ACP session notifications.
//!
//! One [`EventTranslator`] belongs to one ACP session. It remembers which
//! tool calls it has announced so that every completion is paired with an
//! earlier `tool_call` carrying the same id, and so that each call is
//! completed at most once.

pub mod notification;

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TranslatorConfig;
use crate::stream::accumulate::truncate_to_char_boundary;
use crate::stream::{ContentBlock, StreamEvent, ToolPayload, concat_text};

pub use notification::{
    AcpToolKind, SessionNotification, SessionUpdate, StopReason, ToolCall, ToolCallStatus,
    ToolCallUpdate,
};

/// Emitted for `system/init`: the vendor session is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initialized {
    pub session_id: String,
    pub model: String,
    pub permission_mode: Option<String>,
}

/// Emitted for `result`: the turn is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCompleted {
    pub session_id: String,
    pub text: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// A tool's output was cut to fit the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResultTruncated {
    pub tool_call_id: String,
    pub original_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("tool call {call_id} completed more than once")]
    DuplicateCompletion { call_id: String },
}

/// Everything one event can produce, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslatorOutput {
    Initialized(Initialized),
    Notification(SessionNotification),
    ToolResultTruncated(ToolResultTruncated),
    ResultCompleted(ResultCompleted),
    Error(TranslateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    InProgress,
    Completed,
}

#[derive(Debug)]
pub struct EventTranslator {
    session_id: String,
    config: TranslatorConfig,
    calls: HashMap<String, CallState>,
}

impl EventTranslator {
    /// `session_id` is the ACP session the notifications belong to.
    pub fn new(session_id: impl Into<String>, config: TranslatorConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            calls: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Translate one event. Never fails; problems come back as
    /// [`TranslatorOutput::Error`] entries.
    pub fn translate(&mut self, event: StreamEvent) -> Vec<TranslatorOutput> {
        match event {
            StreamEvent::SystemInit {
                session_id,
                model,
                permission_mode,
                ..
            } => vec![TranslatorOutput::Initialized(Initialized {
                session_id,
                model,
                permission_mode,
            })],

            StreamEvent::UserMessage { content, .. } => {
                vec![self.notification(SessionUpdate::UserMessageChunk {
                    content: ContentBlock::text(concat_text(&content)),
                })]
            }

            StreamEvent::AssistantMessage { content, .. } => {
                vec![self.notification(SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::text(concat_text(&content)),
                })]
            }

            StreamEvent::ToolCallStarted { call_id, tool, .. } => {
                self.calls.insert(call_id.clone(), CallState::InProgress);
                vec![self.tool_call_started(call_id, &tool)]
            }

            StreamEvent::ToolCallCompleted { call_id, tool, .. } => {
                self.tool_call_completed(call_id, tool)
            }

            StreamEvent::Result {
                session_id,
                duration_ms,
                is_error,
                result_text,
            } => vec![
                self.notification(SessionUpdate::SessionInfoUpdate {
                    title: None,
                    updated_at: Utc::now(),
                }),
                TranslatorOutput::ResultCompleted(ResultCompleted {
                    session_id,
                    text: result_text,
                    duration_ms,
                    success: !is_error,
                }),
            ],
        }
    }

    fn notification(&self, update: SessionUpdate) -> TranslatorOutput {
        TranslatorOutput::Notification(SessionNotification {
            session_id: self.session_id.clone(),
            update,
        })
    }

    fn tool_call_started(&self, call_id: String, tool: &ToolPayload) -> TranslatorOutput {
        self.notification(SessionUpdate::ToolCall(ToolCall {
            tool_call_id: call_id,
            title: tool.title(),
            kind: AcpToolKind::from(&tool.kind),
            status: ToolCallStatus::InProgress,
            raw_input: Some(Value::Object(tool.args.clone())),
        }))
    }

    fn tool_call_completed(&mut self, call_id: String, tool: ToolPayload) -> Vec<TranslatorOutput> {
        let mut out = Vec::with_capacity(3);

        match self.calls.get(&call_id) {
            Some(CallState::Completed) => {
                warn!(call_id = %call_id, "ignoring duplicate tool call completion");
                return vec![TranslatorOutput::Error(TranslateError::DuplicateCompletion {
                    call_id,
                })];
            }
            Some(CallState::InProgress) => {}
            None => {
                debug!(call_id = %call_id, "completion without a start; announcing the call first");
                out.push(self.tool_call_started(call_id.clone(), &tool));
            }
        }
        self.calls.insert(call_id.clone(), CallState::Completed);

        let status = if tool_succeeded(tool.result.as_ref()) {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Failed
        };

        let raw_output = match tool.result {
            None => None,
            Some(result) => {
                let (raw, truncated) = self.bounded_output(result);
                if let Some(original_bytes) = truncated {
                    warn!(
                        call_id = %call_id,
                        original_bytes,
                        max_bytes = self.config.tool_result_max_bytes,
                        "tool output truncated"
                    );
                    out.push(TranslatorOutput::ToolResultTruncated(ToolResultTruncated {
                        tool_call_id: call_id.clone(),
                        original_bytes,
                    }));
                }
                Some(raw)
            }
        };

        out.push(self.notification(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: call_id,
            status,
            raw_output,
        })));
        out
    }

    /// Return the output to report and, if it had to be cut, its original
    /// size in bytes.
    ///
    /// An oversized text field is cut on its own. Otherwise the whole
    /// serialized result must fit, or it is sent as a cut JSON string.
    fn bounded_output(&self, result: Value) -> (Value, Option<usize>) {
        let max = self.config.tool_result_max_bytes;
        if let Some(text) = output_text(&result) {
            if text.len() > max {
                let cut = truncate_to_char_boundary(&text, max).to_string();
                return (Value::String(cut), Some(text.len()));
            }
        }
        let serialized = result.to_string();
        if serialized.len() <= max {
            return (result, None);
        }
        let cut = truncate_to_char_boundary(&serialized, max).to_string();
        (Value::String(cut), Some(serialized.len()))
    }
}

/// Success inference over the vendor's open-ended result object.
///
/// Precedence: an `error` key decides (success iff null); otherwise a
/// `success` key decides (success iff non-null); otherwise success.
pub fn tool_succeeded(result: Option<&Value>) -> bool {
    let Some(Value::Object(obj)) = result else {
        return true;
    };
    if let Some(error) = obj.get("error") {
        return error.is_null();
    }
    if let Some(success) = obj.get("success") {
        return !success.is_null();
    }
    true
}

/// The human-readable part of a tool result, if it has an obvious one.
///
/// Looks inside the `success`/`error` wrapper for the usual text fields;
/// falls back to `None` so callers can use the serialized JSON instead.
fn output_text(result: &Value) -> Option<String> {
    let inner = result
        .get("success")
        .filter(|v| !v.is_null())
        .or_else(|| result.get("error").filter(|v| !v.is_null()))
        .unwrap_or(result);

    if let Some(s) = inner.as_str() {
        return Some(s.to_string());
    }
    ["output", "stdout", "content", "text"]
        .iter()
        .find_map(|key| inner.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const VSID: &str = "6a0e4d8e-5b7c-4f2a-9d1e-3c8b7a6f5e4d";

    fn translator(max: usize) -> EventTranslator {
        EventTranslator::new(
            "acp-1",
            TranslatorConfig {
                tool_result_max_bytes: max,
            },
        )
    }

    fn event(line: serde_json::Value) -> StreamEvent {
        StreamEvent::from_value(line).unwrap()
    }

    fn shell_started(call_id: &str) -> StreamEvent {
        event(json!({
            "type": "tool_call", "subtype": "started", "call_id": call_id,
            "tool_call": {"shellToolCall": {"args": {"command": "echo hi"}}},
            "session_id": VSID
        }))
    }

    fn shell_completed(call_id: &str, result: serde_json::Value) -> StreamEvent {
        event(json!({
            "type": "tool_call", "subtype": "completed", "call_id": call_id,
            "tool_call": {"shellToolCall": {"args": {"command": "echo hi"}, "result": result}},
            "session_id": VSID
        }))
    }

    fn updates(outputs: &[TranslatorOutput]) -> Vec<&SessionUpdate> {
        outputs
            .iter()
            .filter_map(|o| match o {
                TranslatorOutput::Notification(n) => Some(&n.update),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn system_init_yields_initialized_signal_only() {
        let mut t = translator(1024);
        let out = t.translate(event(json!({
            "type": "system", "subtype": "init", "cwd": "/w",
            "session_id": VSID, "model": "gpt-5", "permissionMode": "default"
        })));
        assert_eq!(
            out,
            vec![TranslatorOutput::Initialized(Initialized {
                session_id: VSID.to_string(),
                model: "gpt-5".to_string(),
                permission_mode: Some("default".to_string()),
            })]
        );
    }

    #[test]
    fn messages_become_chunks_with_concatenated_text() {
        let mut t = translator(1024);
        let out = t.translate(event(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]},
            "session_id": VSID
        })));
        assert_eq!(
            updates(&out),
            vec![&SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("ab")
            }]
        );

        let out = t.translate(event(json!({
            "type": "user",
            "message": {"content": [{"type": "text", "text": "do it"}]},
            "session_id": VSID
        })));
        match &out[0] {
            TranslatorOutput::Notification(n) => {
                assert_eq!(n.session_id, "acp-1");
                assert_eq!(
                    n.update,
                    SessionUpdate::UserMessageChunk {
                        content: ContentBlock::text("do it")
                    }
                );
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn started_then_completed_share_the_tool_call_id() {
        let mut t = translator(1024);
        let started = t.translate(shell_started("call-7"));
        let completed = t.translate(shell_completed(
            "call-7",
            json!({"success": {"output": "hi\n", "exitCode": 0}}),
        ));

        match updates(&started).as_slice() {
            [SessionUpdate::ToolCall(call)] => {
                assert_eq!(call.tool_call_id, "call-7");
                assert_eq!(call.title, "shell");
                assert_eq!(call.kind, AcpToolKind::Execute);
                assert_eq!(call.status, ToolCallStatus::InProgress);
                assert_eq!(call.raw_input, Some(json!({"command": "echo hi"})));
            }
            other => panic!("unexpected start output: {other:?}"),
        }
        match updates(&completed).as_slice() {
            [SessionUpdate::ToolCallUpdate(update)] => {
                assert_eq!(update.tool_call_id, "call-7");
                assert_eq!(update.status, ToolCallStatus::Completed);
                assert_eq!(
                    update.raw_output,
                    Some(json!({"success": {"output": "hi\n", "exitCode": 0}}))
                );
            }
            other => panic!("unexpected completion output: {other:?}"),
        }
    }

    #[test]
    fn large_output_is_truncated_once_with_original_size() {
        let mut t = translator(8);
        t.translate(shell_started("c1"));
        let out = t.translate(shell_completed(
            "c1",
            json!({"success": {"output": "abcdefghijklmnopqrstuvwxyz"}}),
        ));

        let truncations: Vec<_> = out
            .iter()
            .filter_map(|o| match o {
                TranslatorOutput::ToolResultTruncated(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(
            truncations,
            vec![&ToolResultTruncated {
                tool_call_id: "c1".to_string(),
                original_bytes: 26,
            }]
        );

        match updates(&out).as_slice() {
            [SessionUpdate::ToolCallUpdate(update)] => {
                let raw = update.raw_output.as_ref().and_then(Value::as_str).unwrap();
                assert!(raw.len() <= 8);
                assert_eq!(raw, "abcdefgh");
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn small_output_field_does_not_hide_a_large_result() {
        let mut t = translator(8);
        t.translate(shell_started("c1"));
        let result = json!({"success": {"output": "ok", "stderr": "x".repeat(1000)}});
        let serialized_len = result.to_string().len();
        let out = t.translate(shell_completed("c1", result));

        assert!(out.iter().any(|o| matches!(
            o,
            TranslatorOutput::ToolResultTruncated(t)
                if t.tool_call_id == "c1" && t.original_bytes == serialized_len
        )));
        match updates(&out).as_slice() {
            [SessionUpdate::ToolCallUpdate(update)] => {
                let raw = update.raw_output.as_ref().and_then(Value::as_str).unwrap();
                assert!(raw.len() <= 8, "{raw}");
                assert_eq!(update.status, ToolCallStatus::Completed);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn results_within_the_limit_pass_through_unchanged() {
        let mut t = translator(1024);
        t.translate(shell_started("c1"));
        let result = json!({"success": {"output": "ok", "exitCode": 0}});
        let out = t.translate(shell_completed("c1", result.clone()));
        assert!(!out.iter().any(|o| matches!(o, TranslatorOutput::ToolResultTruncated(_))));
        match updates(&out).as_slice() {
            [SessionUpdate::ToolCallUpdate(update)] => {
                assert_eq!(update.raw_output.as_ref(), Some(&result));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn completion_without_start_announces_the_call_first() {
        let mut t = translator(1024);
        let out = t.translate(shell_completed("orphan", json!({"success": {}})));
        match updates(&out).as_slice() {
            [SessionUpdate::ToolCall(call), SessionUpdate::ToolCallUpdate(update)] => {
                assert_eq!(call.tool_call_id, "orphan");
                assert_eq!(update.tool_call_id, "orphan");
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn duplicate_completion_is_an_error_not_a_second_update() {
        let mut t = translator(1024);
        t.translate(shell_started("c1"));
        t.translate(shell_completed("c1", json!({"success": {}})));
        let out = t.translate(shell_completed("c1", json!({"success": {}})));
        assert_eq!(
            out,
            vec![TranslatorOutput::Error(TranslateError::DuplicateCompletion {
                call_id: "c1".to_string()
            })]
        );
    }

    #[test]
    fn success_inference_preserves_precedence() {
        assert!(tool_succeeded(None));
        assert!(tool_succeeded(Some(&json!("plain"))));
        assert!(tool_succeeded(Some(&json!({}))));
        assert!(!tool_succeeded(Some(&json!({"error": {"message": "boom"}}))));
        assert!(tool_succeeded(Some(&json!({"error": null, "success": null}))));
        assert!(tool_succeeded(Some(&json!({"success": {"output": ""}}))));
        // A present-but-false success flag is still non-null.
        assert!(tool_succeeded(Some(&json!({"success": false}))));
        assert!(!tool_succeeded(Some(&json!({"success": null}))));
    }

    #[test]
    fn failed_tool_reports_failed_status() {
        let mut t = translator(1024);
        t.translate(shell_started("c1"));
        let out = t.translate(shell_completed("c1", json!({"error": {"message": "denied"}})));
        match updates(&out).as_slice() {
            [SessionUpdate::ToolCallUpdate(update)] => {
                assert_eq!(update.status, ToolCallStatus::Failed);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn result_emits_info_update_and_completion() {
        let mut t = translator(1024);
        let out = t.translate(event(json!({
            "type": "result", "subtype": "success", "duration_ms": 42,
            "is_error": false, "result": "done", "session_id": VSID
        })));
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            TranslatorOutput::Notification(SessionNotification {
                update: SessionUpdate::SessionInfoUpdate { .. },
                ..
            })
        ));
        assert_eq!(
            out[1],
            TranslatorOutput::ResultCompleted(ResultCompleted {
                session_id: VSID.to_string(),
                text: "done".to_string(),
                duration_ms: 42,
                success: true,
            })
        );
    }
}
