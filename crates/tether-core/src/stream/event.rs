//! Typed events decoded from the vendor CLI's `stream-json` output.
//!
//! Each stdout line is one JSON object discriminated by `type` (and, for
//! some types, `subtype`). The wire shapes live in the private [`wire`]
//! module; [`StreamEvent`] deserializes through them via `try_from`, so a
//! line either becomes a fully validated event or a schema error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A text content block. Only `{"type":"text"}` blocks are recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
        }
    }
}

/// Concatenate the text of every block, in order.
pub fn concat_text(blocks: &[ContentBlock]) -> String {
    blocks.iter().map(ContentBlock::as_text).collect()
}

/// The tool family a vendor tool call belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Read,
    Write,
    Edit,
    Shell,
    Grep,
    Ls,
    Glob,
    Todo,
    /// Any other `<name>ToolCall` key; holds the raw key.
    Other(String),
}

impl ToolKind {
    /// Map a vendor payload key (e.g. `shellToolCall`) to a kind.
    pub fn from_key(key: &str) -> Self {
        match key {
            "readToolCall" => ToolKind::Read,
            "writeToolCall" => ToolKind::Write,
            "editToolCall" => ToolKind::Edit,
            "shellToolCall" => ToolKind::Shell,
            "grepToolCall" => ToolKind::Grep,
            "lsToolCall" => ToolKind::Ls,
            "globToolCall" => ToolKind::Glob,
            "todoToolCall" | "updateTodosToolCall" => ToolKind::Todo,
            other => ToolKind::Other(other.to_string()),
        }
    }

    /// Normalized tool name used as the notification title.
    pub fn title(&self) -> String {
        match self {
            ToolKind::Read => "read_file".to_string(),
            ToolKind::Write => "write_file".to_string(),
            ToolKind::Edit => "edit_file".to_string(),
            ToolKind::Shell => "shell".to_string(),
            ToolKind::Grep => "grep".to_string(),
            ToolKind::Ls => "ls".to_string(),
            ToolKind::Glob => "glob".to_string(),
            ToolKind::Todo => "todo".to_string(),
            ToolKind::Other(key) => derive_tool_name(key),
        }
    }
}

/// Derive a snake_case tool name from an unmapped payload key.
///
/// `readLintsToolCall` becomes `read_lints`; a kebab `-tool-call` suffix is
/// stripped as well.
fn derive_tool_name(key: &str) -> String {
    let stem = key
        .strip_suffix("ToolCall")
        .or_else(|| key.strip_suffix("-tool-call"))
        .unwrap_or(key);

    let mut name = String::with_capacity(stem.len() + 4);
    for (i, ch) in stem.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !name.ends_with('_') {
                name.push('_');
            }
            name.push(ch.to_ascii_lowercase());
        } else if ch == '-' {
            name.push('_');
        } else {
            name.push(ch);
        }
    }
    name
}

/// A tool invocation normalized from the vendor's single-key object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPayload {
    pub kind: ToolKind,
    pub args: Map<String, Value>,
    pub result: Option<Value>,
}

impl ToolPayload {
    pub fn title(&self) -> String {
        self.kind.title()
    }
}

impl TryFrom<Map<String, Value>> for ToolPayload {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "tool_call must have exactly one tool key, found {}",
                map.len()
            ));
        }
        let Some((key, body)) = map.into_iter().next() else {
            return Err("tool_call is empty".to_string());
        };
        let body: wire::ToolBody =
            serde_json::from_value(body).map_err(|e| format!("invalid `{key}` body: {e}"))?;
        Ok(ToolPayload {
            kind: ToolKind::from_key(&key),
            args: body.args,
            result: body.result,
        })
    }
}

/// One validated event from the vendor stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "wire::Line")]
pub enum StreamEvent {
    SystemInit {
        cwd: String,
        session_id: String,
        model: String,
        permission_mode: Option<String>,
    },
    UserMessage {
        session_id: String,
        content: Vec<ContentBlock>,
    },
    AssistantMessage {
        session_id: String,
        content: Vec<ContentBlock>,
    },
    ToolCallStarted {
        call_id: String,
        session_id: String,
        tool: ToolPayload,
    },
    ToolCallCompleted {
        call_id: String,
        session_id: String,
        tool: ToolPayload,
    },
    Result {
        session_id: String,
        duration_ms: u64,
        is_error: bool,
        result_text: String,
    },
}

impl StreamEvent {
    /// Validate an already-decoded JSON value against the event union.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn session_id(&self) -> &str {
        match self {
            StreamEvent::SystemInit { session_id, .. }
            | StreamEvent::UserMessage { session_id, .. }
            | StreamEvent::AssistantMessage { session_id, .. }
            | StreamEvent::ToolCallStarted { session_id, .. }
            | StreamEvent::ToolCallCompleted { session_id, .. }
            | StreamEvent::Result { session_id, .. } => session_id,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            StreamEvent::SystemInit { .. } => "system-init",
            StreamEvent::UserMessage { .. } => "user-message",
            StreamEvent::AssistantMessage { .. } => "assistant-message",
            StreamEvent::ToolCallStarted { .. } => "tool-call-started",
            StreamEvent::ToolCallCompleted { .. } => "tool-call-completed",
            StreamEvent::Result { .. } => "result",
        }
    }
}

/// Vendor session ids are UUIDs; keep the original spelling once checked.
fn check_session_id(id: String) -> Result<String, String> {
    match Uuid::parse_str(&id) {
        Ok(_) => Ok(id),
        Err(e) => Err(format!("session_id {id:?} is not a UUID: {e}")),
    }
}

impl TryFrom<wire::Line> for StreamEvent {
    type Error = String;

    fn try_from(line: wire::Line) -> Result<Self, Self::Error> {
        let event = match line {
            wire::Line::System(sys) => {
                let wire::SystemSubtype::Init = sys.subtype;
                StreamEvent::SystemInit {
                    cwd: sys.cwd,
                    session_id: check_session_id(sys.session_id)?,
                    model: sys.model,
                    permission_mode: sys.permission_mode,
                }
            }
            wire::Line::User(msg) => StreamEvent::UserMessage {
                session_id: check_session_id(msg.session_id)?,
                content: msg.message.content,
            },
            wire::Line::Assistant(msg) => StreamEvent::AssistantMessage {
                session_id: check_session_id(msg.session_id)?,
                content: msg.message.content,
            },
            wire::Line::ToolCall(call) => {
                let session_id = check_session_id(call.session_id)?;
                let tool = ToolPayload::try_from(call.tool_call)?;
                match call.subtype {
                    wire::ToolCallSubtype::Started => StreamEvent::ToolCallStarted {
                        call_id: call.call_id,
                        session_id,
                        tool,
                    },
                    wire::ToolCallSubtype::Completed => StreamEvent::ToolCallCompleted {
                        call_id: call.call_id,
                        session_id,
                        tool,
                    },
                }
            }
            wire::Line::Result(res) => {
                let wire::ResultSubtype::Success = res.subtype;
                StreamEvent::Result {
                    session_id: check_session_id(res.session_id)?,
                    duration_ms: res.duration_ms,
                    is_error: res.is_error,
                    result_text: res.result,
                }
            }
        };
        Ok(event)
    }
}

mod wire {
    use serde::Deserialize;
    use serde_json::{Map, Value};

    use super::ContentBlock;

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Line {
        System(System),
        User(Message),
        Assistant(Message),
        ToolCall(ToolCall),
        Result(ResultLine),
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SystemSubtype {
        Init,
    }

    #[derive(Debug, Deserialize)]
    pub struct System {
        pub subtype: SystemSubtype,
        pub cwd: String,
        pub session_id: String,
        pub model: String,
        #[serde(default, rename = "permissionMode", alias = "permission_mode")]
        pub permission_mode: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Message {
        pub session_id: String,
        pub message: MessageBody,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageBody {
        pub content: Vec<ContentBlock>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ToolCallSubtype {
        Started,
        Completed,
    }

    #[derive(Debug, Deserialize)]
    pub struct ToolCall {
        pub subtype: ToolCallSubtype,
        pub call_id: String,
        pub session_id: String,
        pub tool_call: Map<String, Value>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ToolBody {
        #[serde(default)]
        pub args: Map<String, Value>,
        #[serde(default)]
        pub result: Option<Value>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ResultSubtype {
        Success,
    }

    #[derive(Debug, Deserialize)]
    pub struct ResultLine {
        pub subtype: ResultSubtype,
        pub session_id: String,
        pub duration_ms: u64,
        pub is_error: bool,
        pub result: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "4f1c9a52-3a8e-4d7e-9b0e-2f6c1d8a7b31";

    fn parse(line: &str) -> Result<StreamEvent, serde_json::Error> {
        serde_json::from_str(line)
    }

    #[test]
    fn parses_system_init_with_camel_case_permission_mode() {
        let line = format!(
            r#"{{"type":"system","subtype":"init","cwd":"/w","session_id":"{SID}","model":"gpt-5","permissionMode":"default","apiKeySource":"login"}}"#
        );
        let event = parse(&line).unwrap();
        assert_eq!(
            event,
            StreamEvent::SystemInit {
                cwd: "/w".to_string(),
                session_id: SID.to_string(),
                model: "gpt-5".to_string(),
                permission_mode: Some("default".to_string()),
            }
        );
    }

    #[test]
    fn rejects_unknown_system_subtype() {
        let line = format!(
            r#"{{"type":"system","subtype":"warmup","cwd":"/w","session_id":"{SID}","model":"m"}}"#
        );
        assert!(parse(&line).is_err());
    }

    #[test]
    fn rejects_non_uuid_session_id() {
        let line = r#"{"type":"result","subtype":"success","duration_ms":1,"is_error":false,"result":"ok","session_id":"abc"}"#;
        let err = parse(line).unwrap_err().to_string();
        assert!(err.contains("not a UUID"), "unexpected error: {err}");
    }

    #[test]
    fn parses_assistant_message_content() {
        let line = format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"text","text":"Hel"}},{{"type":"text","text":"lo"}}]}},"session_id":"{SID}"}}"#
        );
        match parse(&line).unwrap() {
            StreamEvent::AssistantMessage { content, .. } => {
                assert_eq!(concat_text(&content), "Hello");
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_text_content_block() {
        let line = format!(
            r#"{{"type":"user","message":{{"content":[{{"type":"image","data":"x"}}]}},"session_id":"{SID}"}}"#
        );
        assert!(parse(&line).is_err());
    }

    #[test]
    fn normalizes_single_key_tool_payload() {
        let line = format!(
            r#"{{"type":"tool_call","subtype":"started","call_id":"c1","tool_call":{{"shellToolCall":{{"args":{{"command":"ls"}}}}}},"session_id":"{SID}"}}"#
        );
        match parse(&line).unwrap() {
            StreamEvent::ToolCallStarted { call_id, tool, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(tool.kind, ToolKind::Shell);
                assert_eq!(tool.args["command"], "ls");
                assert!(tool.result.is_none());
            }
            other => panic!("expected tool call start, got {other:?}"),
        }
    }

    #[test]
    fn rejects_tool_payload_with_two_keys() {
        let line = format!(
            r#"{{"type":"tool_call","subtype":"started","call_id":"c1","tool_call":{{"readToolCall":{{"args":{{}}}},"lsToolCall":{{"args":{{}}}}}},"session_id":"{SID}"}}"#
        );
        let err = parse(&line).unwrap_err().to_string();
        assert!(err.contains("exactly one tool key"), "unexpected error: {err}");
    }

    #[test]
    fn tool_titles_follow_lookup_table() {
        assert_eq!(ToolKind::from_key("readToolCall").title(), "read_file");
        assert_eq!(ToolKind::from_key("writeToolCall").title(), "write_file");
        assert_eq!(ToolKind::from_key("editToolCall").title(), "edit_file");
        assert_eq!(ToolKind::from_key("updateTodosToolCall").title(), "todo");
        assert_eq!(ToolKind::from_key("globToolCall").title(), "glob");
    }

    #[test]
    fn unmapped_tool_titles_are_snake_cased() {
        assert_eq!(ToolKind::from_key("readLintsToolCall").title(), "read_lints");
        assert_eq!(ToolKind::from_key("deleteToolCall").title(), "delete");
        assert_eq!(ToolKind::from_key("web-search-tool-call").title(), "web_search");
        assert_eq!(ToolKind::from_key("mcpToolCall").title(), "mcp");
    }

    #[test]
    fn rejects_unknown_result_subtype() {
        let line = format!(
            r#"{{"type":"result","subtype":"partial","duration_ms":1,"is_error":false,"result":"ok","session_id":"{SID}"}}"#
        );
        assert!(parse(&line).is_err());
    }
}
