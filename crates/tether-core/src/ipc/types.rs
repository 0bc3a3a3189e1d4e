//! Wire types for the hook IPC endpoint: the request union, the per-category
//! response shapes and the handler seam.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hook events the vendor CLI reports. Anything else is rejected with 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEventName {
    SessionStart,
    PreToolUse,
    BeforeShellExecution,
    #[serde(rename = "beforeMCPExecution")]
    BeforeMcpExecution,
    BeforeReadFile,
    SubagentStart,
    Stop,
    SubagentStop,
    BeforeSubmitPrompt,
    AfterFileEdit,
    AfterShellExecution,
    #[serde(rename = "afterMCPExecution")]
    AfterMcpExecution,
    AfterAgentResponse,
    AfterAgentThought,
    PostToolUse,
    SessionEnd,
    PreCompact,
}

impl HookEventName {
    pub const ALL: [HookEventName; 17] = [
        HookEventName::SessionStart,
        HookEventName::PreToolUse,
        HookEventName::BeforeShellExecution,
        HookEventName::BeforeMcpExecution,
        HookEventName::BeforeReadFile,
        HookEventName::SubagentStart,
        HookEventName::Stop,
        HookEventName::SubagentStop,
        HookEventName::BeforeSubmitPrompt,
        HookEventName::AfterFileEdit,
        HookEventName::AfterShellExecution,
        HookEventName::AfterMcpExecution,
        HookEventName::AfterAgentResponse,
        HookEventName::AfterAgentThought,
        HookEventName::PostToolUse,
        HookEventName::SessionEnd,
        HookEventName::PreCompact,
    ];

    /// Name as it appears on the wire and in the vendor hook config.
    pub fn as_str(self) -> &'static str {
        match self {
            HookEventName::SessionStart => "sessionStart",
            HookEventName::PreToolUse => "preToolUse",
            HookEventName::BeforeShellExecution => "beforeShellExecution",
            HookEventName::BeforeMcpExecution => "beforeMCPExecution",
            HookEventName::BeforeReadFile => "beforeReadFile",
            HookEventName::SubagentStart => "subagentStart",
            HookEventName::Stop => "stop",
            HookEventName::SubagentStop => "subagentStop",
            HookEventName::BeforeSubmitPrompt => "beforeSubmitPrompt",
            HookEventName::AfterFileEdit => "afterFileEdit",
            HookEventName::AfterShellExecution => "afterShellExecution",
            HookEventName::AfterMcpExecution => "afterMCPExecution",
            HookEventName::AfterAgentResponse => "afterAgentResponse",
            HookEventName::AfterAgentThought => "afterAgentThought",
            HookEventName::PostToolUse => "postToolUse",
            HookEventName::SessionEnd => "sessionEnd",
            HookEventName::PreCompact => "preCompact",
        }
    }

    pub fn category(self) -> HookCategory {
        match self {
            HookEventName::SessionStart => HookCategory::Context,
            HookEventName::PreToolUse
            | HookEventName::BeforeShellExecution
            | HookEventName::BeforeMcpExecution
            | HookEventName::BeforeReadFile
            | HookEventName::SubagentStart => HookCategory::Permission,
            HookEventName::Stop | HookEventName::SubagentStop => HookCategory::Continuation,
            HookEventName::BeforeSubmitPrompt
            | HookEventName::AfterFileEdit
            | HookEventName::AfterShellExecution
            | HookEventName::AfterMcpExecution
            | HookEventName::AfterAgentResponse
            | HookEventName::AfterAgentThought
            | HookEventName::PostToolUse
            | HookEventName::SessionEnd
            | HookEventName::PreCompact => HookCategory::Observation,
        }
    }
}

impl std::fmt::Display for HookEventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which handler slot and which response shape an event uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookCategory {
    Context,
    Permission,
    Continuation,
    Observation,
}

impl HookCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            HookCategory::Context => "context",
            HookCategory::Permission => "permission",
            HookCategory::Continuation => "continuation",
            HookCategory::Observation => "observation",
        }
    }
}

/// Body of every hook request. Event-specific fields land in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInput {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    pub hook_event_name: HookEventName,
    pub workspace_roots: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HookInput {
    /// Decode and check a request body.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let input: HookInput =
            serde_json::from_slice(body).map_err(|e| format!("invalid hook payload: {e}"))?;
        if input.conversation_id.trim().is_empty() {
            return Err("invalid hook payload: conversation_id must not be empty".to_string());
        }
        Ok(input)
    }

    /// Convenience accessor for an event-specific string field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Permission verdict for a pre-execution event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextResponse {
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinuationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_message: Option<String>,
}

/// Check a handler's output against its category's response type and
/// return the normalized JSON.
pub fn validate_response(category: HookCategory, value: Value) -> Result<Value, String> {
    fn normalize<T: serde::de::DeserializeOwned + Serialize>(value: Value) -> Result<Value, String> {
        let typed: T = serde_json::from_value(value).map_err(|e| e.to_string())?;
        serde_json::to_value(typed).map_err(|e| e.to_string())
    }

    match category {
        HookCategory::Permission => normalize::<PermissionResponse>(value),
        HookCategory::Context => normalize::<ContextResponse>(value),
        HookCategory::Continuation => normalize::<ContinuationResponse>(value),
        HookCategory::Observation if value.is_object() => Ok(value),
        HookCategory::Observation => Err("expected a JSON object".to_string()),
    }
}

/// Failure raised by a handler. A `status_code` in 100..=599 becomes the
/// HTTP status; anything else is reported as a generic 500.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub status_code: Option<u16>,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            message: message.into(),
        }
    }
}

/// Resolves one hook request.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, input: HookInput) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> HookHandler for FnHandler<F>
where
    F: Fn(HookInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, input: HookInput) -> Result<Value, HandlerError> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(HookInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler table. Unset slots fall back to the category default;
/// `routes` entries win over the category slot for their event.
#[derive(Clone, Default)]
pub struct HookHandlers {
    pub permission: Option<Arc<dyn HookHandler>>,
    pub context: Option<Arc<dyn HookHandler>>,
    pub continuation: Option<Arc<dyn HookHandler>>,
    pub routes: HashMap<HookEventName, Arc<dyn HookHandler>>,
}

impl std::fmt::Debug for HookHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self.routes.keys().map(|k| k.as_str()).collect();
        routes.sort_unstable();
        f.debug_struct("HookHandlers")
            .field("permission", &self.permission.is_some())
            .field("context", &self.context.is_some())
            .field("continuation", &self.continuation.is_some())
            .field("routes", &routes)
            .finish()
    }
}

impl HookHandlers {
    pub fn for_event(&self, event: HookEventName) -> Option<Arc<dyn HookHandler>> {
        if let Some(route) = self.routes.get(&event) {
            return Some(Arc::clone(route));
        }
        match event.category() {
            HookCategory::Permission => self.permission.clone(),
            HookCategory::Context => self.context.clone(),
            HookCategory::Continuation => self.continuation.clone(),
            HookCategory::Observation => None,
        }
    }
}

/// Listener kind actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Unix,
    Http,
}

/// Where the vendor CLI's hook shim should send requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEndpoint {
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Request path served on the listener.
    pub hook_path: String,
}

impl HookEndpoint {
    /// Value for the endpoint environment variable: the socket path for
    /// unix transports, the full URL otherwise.
    pub fn env_value(&self) -> String {
        match (&self.socket_path, &self.url) {
            (Some(path), _) if self.transport == Transport::Unix => path.display().to_string(),
            (_, Some(url)) => url.clone(),
            (Some(path), None) => path.display().to_string(),
            (None, None) => String::new(),
        }
    }
}
