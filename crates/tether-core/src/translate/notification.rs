//! ACP session notification shapes emitted by the translator.
//!
//! These serialize to the same JSON the agent-client protocol uses for
//! `session/update`: a `sessionId` plus an `update` object discriminated by
//! `sessionUpdate`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::{ContentBlock, ToolKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "sessionUpdate",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SessionUpdate {
    SessionInfoUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        updated_at: DateTime<Utc>,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    UserMessageChunk {
        content: ContentBlock,
    },
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCallUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub title: String,
    pub kind: AcpToolKind,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    pub tool_call_id: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

/// ACP tool call status. The translator emits `InProgress`, `Completed` and
/// `Failed`; `Pending` is kept so the full ACP vocabulary deserializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// ACP's coarse tool categories, used by clients to pick icons.
///
/// `Delete`, `Move` and `Fetch` have no cursor tool mapped to them yet but
/// belong to the ACP vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcpToolKind {
    Read,
    Edit,
    Delete,
    Move,
    Search,
    Execute,
    Think,
    Fetch,
    Other,
}

impl From<&ToolKind> for AcpToolKind {
    fn from(kind: &ToolKind) -> Self {
        match kind {
            ToolKind::Read => AcpToolKind::Read,
            ToolKind::Write | ToolKind::Edit => AcpToolKind::Edit,
            ToolKind::Shell => AcpToolKind::Execute,
            ToolKind::Grep | ToolKind::Ls | ToolKind::Glob => AcpToolKind::Search,
            ToolKind::Todo => AcpToolKind::Think,
            ToolKind::Other(_) => AcpToolKind::Other,
        }
    }
}

/// Why a prompt turn ended. The vendor CLI only ever finishes a turn, so
/// the harness returns `EndTurn`; the other ACP reasons are kept for
/// clients that share these types with protocol-native agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_use_acp_wire_names() {
        let status: Vec<ToolCallStatus> =
            serde_json::from_str(r#"["pending","in_progress","completed","failed"]"#).unwrap();
        assert_eq!(status[0], ToolCallStatus::Pending);
        let kinds: Vec<AcpToolKind> =
            serde_json::from_str(r#"["delete","move","fetch"]"#).unwrap();
        assert_eq!(kinds, vec![AcpToolKind::Delete, AcpToolKind::Move, AcpToolKind::Fetch]);
        assert_eq!(
            serde_json::to_value([
                StopReason::MaxTokens,
                StopReason::MaxTurnRequests,
                StopReason::Refusal,
                StopReason::Cancelled,
            ])
            .unwrap(),
            serde_json::json!(["max_tokens", "max_turn_requests", "refusal", "cancelled"])
        );
    }

    #[test]
    fn agent_chunk_serializes_in_acp_shape() {
        let n = SessionNotification {
            session_id: "s1".to_string(),
            update: SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("hi"),
            },
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sessionId": "s1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": "hi"}
                }
            })
        );
    }

    #[test]
    fn tool_call_update_uses_camel_case_fields() {
        let update = SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: "c1".to_string(),
            status: ToolCallStatus::Failed,
            raw_output: None,
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "c1",
                "status": "failed"
            })
        );
    }

    #[test]
    fn session_info_update_round_trips() {
        let update = SessionUpdate::SessionInfoUpdate {
            title: None,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"updatedAt\""));
        let back: SessionUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
