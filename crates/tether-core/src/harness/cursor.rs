//! Harness for the `cursor-agent` CLI.
//!
//! Composes the process connection, stream parser, translator, hook server
//! and hook installation into the [`Harness`] lifecycle. Status changes and
//! every translated notification go out on the adapter's event channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::trait_def::Harness;
use super::types::{
    HarnessError, HarnessEvent, HarnessStatus, PromptRequest, PromptResponse, SessionInfo,
};
use crate::config::BridgeConfig;
use crate::connection::{self, ConnectionEvent, ProcessConnection, with_backoff};
use crate::hooks::{HookInstallation, HookPaths, InstallOptions};
use crate::ipc::{
    Decision, HOOK_ENDPOINT_ENV, HandlerError, HookHandlers, HookInput, HookServer, handler_fn,
};
use crate::translate::{EventTranslator, StopReason, TranslatorOutput};

pub const CURSOR_HARNESS_NAME: &str = "cursor";

struct SessionState {
    cwd: PathBuf,
    vendor_session_id: Option<String>,
    model: Option<String>,
    /// `None` while a prompt has it checked out.
    translator: Option<EventTranslator>,
}

/// Clears the in-flight flag however the prompt ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CursorAdapter {
    config: BridgeConfig,
    connection: ProcessConnection,
    server: HookServer,
    installation: Mutex<Option<HookInstallation>>,
    handler_override: Mutex<Option<HookHandlers>>,
    status: Mutex<HarnessStatus>,
    sessions: Mutex<HashMap<String, SessionState>>,
    prompt_in_flight: AtomicBool,
    events: mpsc::UnboundedSender<HarnessEvent>,
}

impl std::fmt::Debug for CursorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorAdapter")
            .field("status", &self.status())
            .field("connection", &self.connection)
            .field("server", &self.server)
            .field("sessions", &locked(&self.sessions).len())
            .finish_non_exhaustive()
    }
}

impl CursorAdapter {
    pub fn new(config: BridgeConfig, events: mpsc::UnboundedSender<HarnessEvent>) -> Self {
        Self {
            connection: ProcessConnection::new(config.connection.clone(), config.parser.clone()),
            server: HookServer::new(config.ipc.clone()),
            config,
            installation: Mutex::new(None),
            handler_override: Mutex::new(None),
            status: Mutex::new(HarnessStatus::Disconnected),
            sessions: Mutex::new(HashMap::new()),
            prompt_in_flight: AtomicBool::new(false),
            events,
        }
    }

    pub fn connection(&self) -> &ProcessConnection {
        &self.connection
    }

    pub fn hook_server(&self) -> &HookServer {
        &self.server
    }

    /// Replace the built-in hook handlers. Applies immediately when
    /// connected and on every later connect.
    pub fn set_hook_handlers(&self, handlers: HookHandlers) {
        if self.server.is_running() {
            self.server.set_handlers(handlers.clone());
        }
        *locked(&self.handler_override) = Some(handlers);
    }

    fn emit(&self, event: HarnessEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: HarnessStatus) {
        let previous = std::mem::replace(&mut *locked(&self.status), status);
        if previous != status {
            info!(from = %previous, to = %status, "harness status changed");
            self.emit(HarnessEvent::Status(status));
        }
    }

    fn require_connected(&self) -> Result<(), HarnessError> {
        match self.status() {
            HarnessStatus::Connected => Ok(()),
            other => Err(HarnessError::NotConnected(other)),
        }
    }

    fn workspace_dir(&self) -> Result<PathBuf, HarnessError> {
        match &self.config.connection.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().map_err(HarnessError::Workspace),
        }
    }

    fn hook_paths(&self) -> Result<HookPaths, HarnessError> {
        match &self.config.harness.hooks_dir {
            Some(dir) => Ok(HookPaths::in_dir(dir.clone())),
            None => Ok(HookPaths::for_workspace(&self.workspace_dir()?)),
        }
    }

    /// Permission allows, context injects the project rules, continuation
    /// adds nothing.
    fn default_handlers(&self) -> Result<HookHandlers, HarnessError> {
        let workspace = self.workspace_dir()?;
        let rules: Vec<PathBuf> = self
            .config
            .harness
            .project_rules
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { workspace.join(p) })
            .collect();

        Ok(HookHandlers {
            permission: Some(handler_fn(|_input: HookInput| async {
                Ok::<_, HandlerError>(json!({ "decision": Decision::Allow }))
            })),
            context: Some(handler_fn(move |_input: HookInput| {
                let rules = rules.clone();
                async move {
                    let text = read_project_rules(&rules).await;
                    let response = if text.is_empty() {
                        json!({})
                    } else {
                        json!({ "additional_context": text })
                    };
                    Ok::<_, HandlerError>(response)
                }
            })),
            continuation: Some(handler_fn(|_input: HookInput| async {
                Ok::<_, HandlerError>(json!({}))
            })),
            routes: HashMap::new(),
        })
    }

    async fn bring_up(&self) -> Result<(), HarnessError> {
        let binary = self.config.connection.binary_path.clone();

        let install = with_backoff(&self.config.retry, "verify installation", || {
            self.connection.verify_installation()
        })
        .await
        .map_err(|e| {
            if e.is_fatal() {
                HarnessError::NotInstalled {
                    binary: binary.clone(),
                    source: e,
                }
            } else {
                e.into()
            }
        })?;
        debug!(version = %install.version, "agent CLI verified");

        let auth = self.connection.verify_auth().await?;
        if !auth.authenticated {
            return Err(HarnessError::NotAuthenticated { binary });
        }
        debug!(account = ?auth.account, via_api_key = auth.via_api_key, "agent CLI authenticated");

        let override_handlers = locked(&self.handler_override).clone();
        let handlers = match override_handlers {
            Some(handlers) => handlers,
            None => self.default_handlers()?,
        };
        self.server.set_handlers(handlers);

        let endpoint = self.server.start().await?;
        self.connection
            .set_env(HOOK_ENDPOINT_ENV, endpoint.env_value());

        if self.config.harness.skip_hook_install {
            debug!("hook installation skipped by configuration");
        } else {
            let options = InstallOptions {
                timeout_secs: self.config.ipc.request_timeout().as_secs().max(1) + 5,
                fallback_decision: self.config.ipc.default_permission,
                ..InstallOptions::default()
            };
            let installation = HookInstallation::install(self.hook_paths()?, &endpoint, &options)?;
            *locked(&self.installation) = Some(installation);
        }

        self.connection.install_signal_forwarding()?;
        Ok(())
    }

    /// Run every teardown step, returning the first failure.
    async fn tear_down(&self) -> Result<(), HarnessError> {
        let mut first: Option<HarnessError> = None;
        let mut keep = |e: HarnessError| {
            warn!(error = %e, "teardown step failed");
            if first.is_none() {
                first = Some(e);
            }
        };

        if let Err(e) = self.connection.disconnect().await {
            keep(e.into());
        }
        if let Err(e) = self.server.stop().await {
            keep(e.into());
        }
        let installation = locked(&self.installation).take();
        if let Some(mut installation) = installation {
            if let Err(e) = installation.cleanup() {
                keep(e.into());
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn forward(&self, output: TranslatorOutput) {
        let event = match output {
            TranslatorOutput::Initialized(init) => HarnessEvent::Initialized(init),
            TranslatorOutput::Notification(n) => HarnessEvent::Notification(n),
            TranslatorOutput::ToolResultTruncated(t) => HarnessEvent::ToolResultTruncated(t),
            TranslatorOutput::ResultCompleted(r) => HarnessEvent::ResultCompleted(r),
            TranslatorOutput::Error(e) => {
                warn!(error = %e, "translator rejected an event");
                HarnessEvent::Warning(e.to_string())
            }
        };
        self.emit(event);
    }
}

async fn read_project_rules(paths: &[PathBuf]) -> String {
    let mut parts = Vec::new();
    for path in paths {
        match tokio::fs::read_to_string(path).await {
            Ok(text) if !text.trim().is_empty() => parts.push(text.trim_end().to_string()),
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "skipping project rule file"),
        }
    }
    parts.join("\n\n")
}

#[async_trait]
impl Harness for CursorAdapter {
    fn name(&self) -> &str {
        CURSOR_HARNESS_NAME
    }

    fn status(&self) -> HarnessStatus {
        *locked(&self.status)
    }

    async fn connect(&self) -> Result<(), HarnessError> {
        match self.status() {
            HarnessStatus::Connected => return Ok(()),
            HarnessStatus::Connecting => return Err(HarnessError::AlreadyConnecting),
            HarnessStatus::Disconnected | HarnessStatus::Error => {}
        }
        self.set_status(HarnessStatus::Connecting);

        match self.bring_up().await {
            Ok(()) => {
                self.set_status(HarnessStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "connect failed");
                if let Err(teardown) = self.tear_down().await {
                    warn!(error = %teardown, "cleanup after failed connect was incomplete");
                }
                self.set_status(HarnessStatus::Error);
                Err(e)
            }
        }
    }

    async fn new_session(&self, cwd: &Path) -> Result<SessionInfo, HarnessError> {
        self.require_connected()?;
        let session_id = Uuid::new_v4().to_string();

        self.connection.set_working_dir(Some(cwd.to_path_buf()));
        let vendor_session_id = match self.connection.create_chat().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "could not pre-create a vendor chat; the first prompt will start one");
                self.emit(HarnessEvent::Warning(format!("create-chat failed: {e}")));
                None
            }
        };

        locked(&self.sessions).insert(
            session_id.clone(),
            SessionState {
                cwd: cwd.to_path_buf(),
                vendor_session_id: vendor_session_id.clone(),
                model: None,
                translator: Some(EventTranslator::new(
                    session_id.clone(),
                    self.config.translator.clone(),
                )),
            },
        );
        info!(%session_id, vendor_session_id = ?vendor_session_id, cwd = %cwd.display(), "session created");

        Ok(SessionInfo {
            session_id,
            vendor_session_id,
            cwd: cwd.to_path_buf(),
        })
    }

    async fn set_session_model(&self, session_id: &str, model: &str) -> Result<(), HarnessError> {
        let mut sessions = locked(&self.sessions);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| HarnessError::UnknownSession(session_id.to_string()))?;
        session.model = Some(model.to_string());
        debug!(session_id, model, "session model set");
        Ok(())
    }

    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, HarnessError> {
        self.require_connected()?;
        if self.prompt_in_flight.swap(true, Ordering::AcqRel) {
            return Err(HarnessError::PromptInFlight);
        }
        let _in_flight = InFlight(&self.prompt_in_flight);

        let text = request
            .content
            .first()
            .map(|block| block.as_text().to_string())
            .filter(|t| !t.trim().is_empty())
            .ok_or(HarnessError::EmptyPrompt)?;

        let (cwd, vendor_session_id, model, translator) = {
            let mut sessions = locked(&self.sessions);
            let session = sessions
                .get_mut(&request.session_id)
                .ok_or_else(|| HarnessError::UnknownSession(request.session_id.clone()))?;
            (
                session.cwd.clone(),
                session.vendor_session_id.clone(),
                session.model.clone(),
                session.translator.take(),
            )
        };
        let mut translator = translator.unwrap_or_else(|| {
            EventTranslator::new(request.session_id.clone(), self.config.translator.clone())
        });

        self.connection.set_working_dir(Some(cwd));
        let outbound = connection::PromptRequest {
            prompt: text,
            session_id: vendor_session_id,
            model,
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::channel(self.config.connection.event_channel_capacity.max(1));
        let consume = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ConnectionEvent::Stream(event) => {
                        for output in translator.translate(event) {
                            self.forward(output);
                        }
                    }
                    ConnectionEvent::Stderr(chunk) => self.emit(HarnessEvent::Stderr(chunk)),
                    ConnectionEvent::TextTruncated {
                        session_id,
                        original_bytes,
                    } => self.emit(HarnessEvent::TextTruncated {
                        session_id,
                        original_bytes,
                    }),
                    ConnectionEvent::ParseIssues {
                        malformed_lines,
                        invalid_events,
                    } => self.emit(HarnessEvent::Warning(format!(
                        "skipped {malformed_lines} malformed and {invalid_events} unrecognised output lines"
                    ))),
                }
            }
        };
        let (result, ()) = tokio::join!(self.connection.spawn_prompt(outbound, tx), consume);

        {
            let mut sessions = locked(&self.sessions);
            if let Some(session) = sessions.get_mut(&request.session_id) {
                session.translator = Some(translator);
                if let Ok(result) = &result {
                    if result.session_id.is_some() {
                        session.vendor_session_id = result.session_id.clone();
                    }
                }
            }
        }

        let result = result?;
        if !result.success() {
            let tail = result.stderr.trim();
            warn!(exit_code = ?result.exit_code, signal = ?result.signal, "agent exited unsuccessfully");
            self.emit(HarnessEvent::Warning(format!(
                "agent exited with code {:?} (signal {:?}){}{}",
                result.exit_code,
                result.signal,
                if tail.is_empty() { "" } else { ": " },
                tail
            )));
        }

        Ok(PromptResponse {
            stop_reason: StopReason::EndTurn,
        })
    }

    async fn disconnect(&self) -> Result<(), HarnessError> {
        let result = self.tear_down().await;
        self.set_status(HarnessStatus::Disconnected);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn adapter(binary: &str) -> (CursorAdapter, mpsc::UnboundedReceiver<HarnessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = BridgeConfig {
            connection: ConnectionConfig {
                binary_path: binary.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        (CursorAdapter::new(config, tx), rx)
    }

    #[tokio::test]
    async fn prompt_requires_connection() {
        let (adapter, _rx) = adapter("cursor-agent");
        let err = adapter
            .prompt(PromptRequest::text("s", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotConnected(HarnessStatus::Disconnected)));
    }

    #[tokio::test]
    async fn missing_binary_fails_connect_with_install_hint() {
        let (adapter, mut rx) = adapter("/nonexistent/cursor-agent");
        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, HarnessError::NotInstalled { .. }), "{err:?}");
        assert!(err.to_string().contains("Install it"));
        assert_eq!(adapter.status(), HarnessStatus::Error);

        assert_eq!(rx.recv().await, Some(HarnessEvent::Status(HarnessStatus::Connecting)));
        assert_eq!(rx.recv().await, Some(HarnessEvent::Status(HarnessStatus::Error)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_when_never_connected() {
        let (adapter, _rx) = adapter("cursor-agent");
        adapter.disconnect().await.unwrap();
        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.status(), HarnessStatus::Disconnected);
    }

    #[tokio::test]
    async fn project_rules_are_concatenated_and_missing_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.md");
        let b = dir.path().join("b.md");
        std::fs::write(&a, "rule one\n").unwrap();
        std::fs::write(&b, "rule two").unwrap();
        let text = read_project_rules(&[a, dir.path().join("missing.md"), b]).await;
        assert_eq!(text, "rule one\n\nrule two");
    }
}
