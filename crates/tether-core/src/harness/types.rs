//! Types shared by every harness implementation.

use std::path::PathBuf;

use serde::Serialize;

use crate::connection::ConnectionError;
use crate::hooks::HookInstallError;
use crate::ipc::IpcError;
use crate::stream::ContentBlock;
use crate::translate::{
    Initialized, ResultCompleted, SessionNotification, StopReason, ToolResultTruncated,
};

/// Connection lifecycle of a harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for HarnessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HarnessStatus::Disconnected => "disconnected",
            HarnessStatus::Connecting => "connecting",
            HarnessStatus::Connected => "connected",
            HarnessStatus::Error => "error",
        })
    }
}

/// Everything a harness reports upward, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessEvent {
    Status(HarnessStatus),
    Initialized(Initialized),
    Notification(SessionNotification),
    ToolResultTruncated(ToolResultTruncated),
    TextTruncated {
        session_id: String,
        original_bytes: usize,
    },
    ResultCompleted(ResultCompleted),
    Stderr(String),
    /// Non-fatal problem worth surfacing (skipped lines, translator errors).
    Warning(String),
}

/// A session created by [`super::Harness::new_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// ACP session id, minted by the harness.
    pub session_id: String,
    /// The vendor's own chat id, when one could be created up front.
    pub vendor_session_id: Option<String>,
    pub cwd: PathBuf,
}

/// One user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub session_id: String,
    pub content: Vec<ContentBlock>,
}

impl PromptRequest {
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: vec![ContentBlock::text(text)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(
        "`{binary}` is not installed or not executable. Install it with \
         `curl https://cursor.com/install -fsS | bash` and make sure it is on PATH"
    )]
    NotInstalled {
        binary: String,
        #[source]
        source: ConnectionError,
    },

    #[error("`{binary}` is not logged in. Run `{binary} login` or set CURSOR_API_KEY")]
    NotAuthenticated { binary: String },

    #[error("harness is not connected (status: {0})")]
    NotConnected(HarnessStatus),

    #[error("harness is already connecting")]
    AlreadyConnecting,

    #[error("a prompt is already in flight for this harness")]
    PromptInFlight,

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("prompt has no text content")]
    EmptyPrompt,

    #[error("could not determine the workspace directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Hooks(#[from] HookInstallError),
}
