//! The `Harness` trait -- the adapter interface for agent runtimes.
//!
//! Both the protocol-native agent and CLI-wrapping adapters such as
//! [`super::CursorAdapter`] implement it. The trait is object-safe so it
//! can be stored as `Box<dyn Harness>` in the [`super::HarnessRegistry`].

use std::path::Path;

use async_trait::async_trait;

use super::types::{HarnessError, HarnessStatus, PromptRequest, PromptResponse, SessionInfo};

/// Lifecycle: `connect → (new_session → prompt)* → disconnect`.
#[async_trait]
pub trait Harness: Send + Sync {
    /// Human-readable name for this harness (e.g. "cursor").
    fn name(&self) -> &str;

    fn status(&self) -> HarnessStatus;

    /// Verify the agent is usable and bring up everything a prompt needs.
    async fn connect(&self) -> Result<(), HarnessError>;

    /// Open a session rooted at `cwd`.
    async fn new_session(&self, cwd: &Path) -> Result<SessionInfo, HarnessError>;

    /// Model to use for later prompts in `session_id`.
    async fn set_session_model(&self, session_id: &str, model: &str) -> Result<(), HarnessError>;

    /// Run one turn. Notifications are reported through the harness's event
    /// channel while this is pending.
    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, HarnessError>;

    /// Tear everything down. Every step runs even when an earlier one fails.
    async fn disconnect(&self) -> Result<(), HarnessError>;
}

// Compile-time assertion: Harness must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};
