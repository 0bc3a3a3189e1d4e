//! Lifecycle of the vendor CLI process.
//!
//! A [`ProcessConnection`] runs at most one prompt at a time. Each prompt is
//! a fresh child in its own process group: the prompt text goes to stdin,
//! stdout is fed through a [`StreamParser`] and every parsed event is sent
//! on a bounded channel. A full channel stops stdout reads, which is the
//! only backpressure the child ever sees.
//!
//! ```text
//!   spawn_prompt ──> child (pgid leader) ──stdout──> StreamParser ──> mpsc ──> caller
//!        │                  │
//!        │                  └──stderr──> ring buffer + ConnectionEvent::Stderr
//!        └── ActiveSlot {pid, closed}  <── disconnect(): SIGTERM -pgid, grace, SIGKILL
//! ```

pub mod args;
pub mod probe;
pub mod retry;
pub(crate) mod signals;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ParserConfig};
use crate::stream::{ParserObserver, PushResult, StreamEvent, StreamParser};

pub use args::{API_KEY_ENV, PromptMode, PromptRequest};
pub use probe::{AuthStatus, InstallationInfo, ModelInfo};
pub use retry::{Retryable, with_backoff};

use signals::SignalForwarder;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("`{binary}` was not found; is it installed and on PATH?")]
    NotInstalled {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("`{binary}` is not executable")]
    PermissionDenied {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("a prompt is already active on this connection")]
    AlreadyActive,

    #[error("`{binary} {command}` timed out after {timeout_ms} ms")]
    ProbeTimeout {
        binary: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("`{binary} {command}` failed: {message}")]
    ProbeFailed {
        binary: String,
        command: String,
        message: String,
    },

    #[error("agent process I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Missing or non-executable binaries cannot fix themselves, and a busy
    /// connection stays busy until its prompt ends.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotInstalled { .. }
                | ConnectionError::PermissionDenied { .. }
                | ConnectionError::AlreadyActive
        )
    }
}

impl Retryable for ConnectionError {
    fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

fn classify_spawn_error(binary: &str, source: io::Error) -> ConnectionError {
    let binary = binary.to_string();
    match source.kind() {
        io::ErrorKind::NotFound => ConnectionError::NotInstalled { binary, source },
        io::ErrorKind::PermissionDenied => ConnectionError::PermissionDenied { binary, source },
        _ => ConnectionError::Spawn { binary, source },
    }
}

/// Everything a prompt produces, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Stream(StreamEvent),
    /// A chunk of the child's stderr, lossily decoded.
    Stderr(String),
    /// A session's accumulated assistant text hit the cap.
    TextTruncated {
        session_id: String,
        original_bytes: usize,
    },
    /// Summary of lines skipped over the whole prompt; sent once, at the end,
    /// only when something was skipped.
    ParseIssues {
        malformed_lines: usize,
        invalid_events: usize,
    },
}

/// Outcome of one [`ProcessConnection::spawn_prompt`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptResult {
    /// Vendor session id from the init event, else the last known one.
    pub session_id: Option<String>,
    pub result_text: Option<String>,
    pub events: Vec<StreamEvent>,
    /// Valid events the parser produced, including the final flush.
    pub parsed_events: usize,
    /// Reads after which stdout was held back until the queue drained.
    pub backpressure_pauses: usize,
    /// Tail of stderr, bounded by `stderr_buffer_bytes`.
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Terminating signal, when the child did not exit normally.
    pub signal: Option<i32>,
}

impl PromptResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug)]
struct ActiveProcess {
    pid: u32,
    closed: watch::Receiver<bool>,
}

/// Which child, if any, currently owns the connection.
#[derive(Debug, Default)]
pub(crate) struct ActiveSlot {
    inner: Mutex<Option<ActiveProcess>>,
}

impl ActiveSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveProcess>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.lock().as_ref().map(|p| p.pid)
    }

    fn snapshot(&self) -> Option<(u32, watch::Receiver<bool>)> {
        self.lock().as_ref().map(|p| (p.pid, p.closed.clone()))
    }
}

/// Clears the slot when the prompt future finishes or is dropped.
struct SlotGuard(Arc<ActiveSlot>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// Collects parser truncation notices so they can be forwarded as events.
#[derive(Clone, Default)]
struct Notices(Arc<Mutex<Vec<ConnectionEvent>>>);

impl Notices {
    fn take(&self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ParserObserver for Notices {
    fn text_truncated(&mut self, session_id: &str, original_bytes: usize) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ConnectionEvent::TextTruncated {
                session_id: session_id.to_string(),
                original_bytes,
            });
    }
}

#[derive(Default)]
struct Collected {
    events: Vec<StreamEvent>,
    init_session: Option<String>,
    result_text: Option<String>,
}

struct ProbeOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ProbeOutput {
    fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with {}", self.status)
        } else {
            stderr.to_string()
        }
    }
}

/// Owner of the vendor CLI binary: probes, prompts and teardown.
pub struct ProcessConnection {
    config: ConnectionConfig,
    parser: ParserConfig,
    env: Mutex<HashMap<String, String>>,
    working_dir: Mutex<Option<PathBuf>>,
    last_session_id: Mutex<Option<String>>,
    active: Arc<ActiveSlot>,
    forwarder: Mutex<Option<SignalForwarder>>,
}

impl std::fmt::Debug for ProcessConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConnection")
            .field("binary", &self.config.binary_path)
            .field("active_pid", &self.active.pid())
            .finish_non_exhaustive()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessConnection {
    pub fn new(config: ConnectionConfig, parser: ParserConfig) -> Self {
        Self {
            env: Mutex::new(config.env.clone()),
            working_dir: Mutex::new(config.working_dir.clone()),
            config,
            parser,
            last_session_id: Mutex::new(None),
            active: Arc::new(ActiveSlot::default()),
            forwarder: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Set (or replace) an environment variable for future children.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        locked(&self.env).insert(key.into(), value.into());
    }

    pub fn set_working_dir(&self, dir: Option<PathBuf>) {
        *locked(&self.working_dir) = dir;
    }

    pub fn last_session_id(&self) -> Option<String> {
        locked(&self.last_session_id).clone()
    }

    pub fn set_last_session_id(&self, id: Option<String>) {
        *locked(&self.last_session_id) = id;
    }

    pub fn is_active(&self) -> bool {
        self.active.pid().is_some()
    }

    pub fn active_pid(&self) -> Option<u32> {
        self.active.pid()
    }

    fn has_api_key(&self) -> bool {
        self.config.api_key.is_some() || locked(&self.env).contains_key(API_KEY_ENV)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary_path);
        if let Some(dir) = locked(&self.working_dir).as_ref() {
            cmd.current_dir(dir);
        }
        cmd.envs(locked(&self.env).iter());
        cmd
    }

    // -----------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------

    async fn run_probe(&self, args: &[&str]) -> Result<ProbeOutput, ConnectionError> {
        let command = args.join(" ");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.config.binary_path, command = %command, "running probe");
        let child = cmd
            .spawn()
            .map_err(|e| classify_spawn_error(&self.config.binary_path, e))?;

        match tokio::time::timeout(self.config.probe_timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProbeOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            Err(_) => Err(ConnectionError::ProbeTimeout {
                binary: self.config.binary_path.clone(),
                command,
                timeout_ms: self.config.probe_timeout_ms,
            }),
        }
    }

    fn probe_failed(&self, command: &str, message: impl Into<String>) -> ConnectionError {
        ConnectionError::ProbeFailed {
            binary: self.config.binary_path.clone(),
            command: command.to_string(),
            message: message.into(),
        }
    }

    async fn successful_probe(&self, args: &[&str]) -> Result<ProbeOutput, ConnectionError> {
        let out = self.run_probe(args).await?;
        if !out.status.success() {
            return Err(self.probe_failed(&args.join(" "), out.failure_message()));
        }
        Ok(out)
    }

    /// Run `--version`; a missing binary is reported as
    /// [`ConnectionError::NotInstalled`].
    pub async fn verify_installation(&self) -> Result<InstallationInfo, ConnectionError> {
        let out = self.successful_probe(&["--version"]).await?;
        let version = probe::parse_version(&out.stdout)
            .or_else(|| probe::parse_version(&out.stderr))
            .ok_or_else(|| self.probe_failed("--version", "no version in output"))?;
        info!(binary = %self.config.binary_path, %version, "agent CLI found");
        Ok(InstallationInfo { version })
    }

    /// A configured API key counts as authenticated without asking the CLI.
    pub async fn verify_auth(&self) -> Result<AuthStatus, ConnectionError> {
        if self.has_api_key() {
            debug!("API key configured, skipping status probe");
            return Ok(AuthStatus {
                authenticated: true,
                account: None,
                via_api_key: true,
            });
        }
        let out = self.run_probe(&["status"]).await?;
        let status = probe::parse_auth_status(&format!("{}\n{}", out.stdout, out.stderr));
        debug!(authenticated = status.authenticated, account = ?status.account, "auth status");
        Ok(status)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ConnectionError> {
        let out = self.successful_probe(&["models"]).await?;
        Ok(probe::parse_model_list(&out.stdout))
    }

    /// Vendor session ids known to the CLI.
    pub async fn list_sessions(&self) -> Result<Vec<String>, ConnectionError> {
        let out = self.successful_probe(&["ls"]).await?;
        Ok(probe::extract_uuids(&out.stdout))
    }

    /// Ask the CLI for a new, empty chat and return its id.
    pub async fn create_chat(&self) -> Result<String, ConnectionError> {
        let out = self.successful_probe(&["create-chat"]).await?;
        probe::extract_uuids(&out.stdout)
            .into_iter()
            .next()
            .ok_or_else(|| self.probe_failed("create-chat", "no session id in output"))
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    /// Run one prompt to completion, sending events on `events` as they
    /// arrive.
    ///
    /// Fails immediately with [`ConnectionError::AlreadyActive`] while
    /// another prompt holds the connection. A closed `events` receiver does
    /// not stop the prompt; events are still collected into the result.
    pub async fn spawn_prompt(
        &self,
        request: PromptRequest,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<PromptResult, ConnectionError> {
        let fallback = self.last_session_id();
        let argv = {
            let env = locked(&self.env);
            args::prompt_args(&request, fallback.as_deref(), &self.config, &env)
        };

        let mut cmd = self.command();
        cmd.args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let (closed_tx, closed_rx) = watch::channel(false);
        let (mut child, _guard) = {
            let mut slot = self.active.lock();
            if slot.is_some() {
                return Err(ConnectionError::AlreadyActive);
            }
            let mut child = cmd
                .spawn()
                .map_err(|e| classify_spawn_error(&self.config.binary_path, e))?;
            let Some(pid) = child.id() else {
                let _ = child.start_kill();
                return Err(ConnectionError::Io(io::Error::other(
                    "spawned agent process has no pid",
                )));
            };
            *slot = Some(ActiveProcess {
                pid,
                closed: closed_rx,
            });
            (child, SlotGuard(Arc::clone(&self.active)))
        };
        let pid = child.id();
        info!(?pid, resume = ?request.session_id.as_ref().or(fallback.as_ref()), "agent prompt started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "agent closed stdin before the prompt was written");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(pump_stderr(
                stderr,
                events.clone(),
                self.config.stderr_buffer_bytes,
            ))
        });

        let notices = Notices::default();
        let mut parser =
            StreamParser::with_observer(self.parser.clone(), Box::new(notices.clone()));
        let mut totals = PushResult::default();
        let mut collected = Collected::default();
        let mut pauses = 0usize;

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                };
                let pushed = parser.push_chunk(&buf[..n]);
                totals.absorb(pushed);
                if pushed.should_pause {
                    pauses += 1;
                    debug!(
                        pending = parser.pending_event_count(),
                        "event queue at high watermark; stdout is not read until the channel accepts them"
                    );
                }
                // Each bounded send waits for the consumer, so stdout stays
                // unread while the channel is full.
                forward(&mut parser, &notices, &events, &mut collected).await;
            }
        }
        totals.absorb(parser.end());
        forward(&mut parser, &notices, &events, &mut collected).await;

        let status = child.wait().await;
        let _ = closed_tx.send(true);
        let status = status?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "stderr reader task failed");
                String::new()
            }),
            None => String::new(),
        };

        if totals.has_issues() {
            warn!(
                malformed = totals.malformed_line_count,
                invalid = totals.invalid_event_count,
                "agent output contained unusable lines"
            );
            let _ = events
                .send(ConnectionEvent::ParseIssues {
                    malformed_lines: totals.malformed_line_count,
                    invalid_events: totals.invalid_event_count,
                })
                .await;
        }

        if let Some(id) = &collected.init_session {
            self.set_last_session_id(Some(id.clone()));
        }

        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        info!(
            ?pid,
            exit_code = ?status.code(),
            ?signal,
            events = collected.events.len(),
            backpressure_pauses = pauses,
            "agent prompt finished"
        );

        Ok(PromptResult {
            session_id: collected.init_session.or(fallback),
            result_text: collected.result_text,
            events: collected.events,
            parsed_events: totals.parsed_count,
            backpressure_pauses: pauses,
            stderr,
            exit_code: status.code(),
            signal,
        })
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Forward SIGINT/SIGTERM aimed at this process to the active child.
    pub fn install_signal_forwarding(&self) -> Result<(), ConnectionError> {
        let mut slot = locked(&self.forwarder);
        if slot.is_none() {
            *slot = Some(SignalForwarder::install(Arc::clone(&self.active))?);
            debug!("signal forwarding installed");
        }
        Ok(())
    }

    pub fn remove_signal_forwarding(&self) {
        if locked(&self.forwarder).take().is_some() {
            debug!("signal forwarding removed");
        }
    }

    /// Stop the active child, if any: SIGTERM to its group, then SIGKILL if
    /// it outlives the grace period. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.remove_signal_forwarding();

        let Some((pid, mut closed)) = self.active.snapshot() else {
            debug!("disconnect with no active agent process");
            return Ok(());
        };

        let grace = self.config.kill_grace();
        info!(pid, "terminating agent process group");
        signals::terminate(pid);

        let exited = tokio::time::timeout(grace, closed.wait_for(|c| *c))
            .await
            .is_ok();
        if exited {
            debug!(pid, "agent exited after SIGTERM");
            return Ok(());
        }

        warn!(pid, grace_ms = self.config.kill_grace_ms, "agent ignored SIGTERM, sending SIGKILL");
        signals::force_kill(pid);
        let exited = tokio::time::timeout(grace, closed.wait_for(|c| *c))
            .await
            .is_ok();
        if !exited {
            warn!(pid, "agent still running after SIGKILL");
        }
        Ok(())
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        if let Some(pid) = self.active.pid() {
            debug!(pid, "connection dropped with an active agent, terminating");
            signals::terminate(pid);
        }
    }
}

async fn forward(
    parser: &mut StreamParser,
    notices: &Notices,
    tx: &mpsc::Sender<ConnectionEvent>,
    collected: &mut Collected,
) {
    for event in parser.drain_events() {
        match &event {
            StreamEvent::SystemInit { session_id, .. } if collected.init_session.is_none() => {
                collected.init_session = Some(session_id.clone());
            }
            StreamEvent::Result { result_text, .. } => {
                collected.result_text = Some(result_text.clone());
            }
            _ => {}
        }
        collected.events.push(event.clone());
        let _ = tx.send(ConnectionEvent::Stream(event)).await;
    }
    for notice in notices.take() {
        let _ = tx.send(notice).await;
    }
}

async fn pump_stderr(
    mut stderr: ChildStderr,
    tx: mpsc::Sender<ConnectionEvent>,
    capacity: usize,
) -> String {
    let mut ring: VecDeque<u8> = VecDeque::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "error reading agent stderr");
                break;
            }
        };
        let chunk = &buf[..n];
        ring.extend(chunk);
        let excess = ring.len().saturating_sub(capacity);
        ring.drain(..excess);
        let _ = tx
            .send(ConnectionEvent::Stderr(
                String::from_utf8_lossy(chunk).into_owned(),
            ))
            .await;
    }
    let bytes: Vec<u8> = ring.into();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_are_classified_by_kind() {
        let e = classify_spawn_error("x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, ConnectionError::NotInstalled { .. }));
        assert!(!e.is_retryable());

        let e = classify_spawn_error("x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(e, ConnectionError::PermissionDenied { .. }));
        assert!(!e.is_retryable());

        let e = classify_spawn_error("x", io::Error::from(io::ErrorKind::Interrupted));
        assert!(matches!(e, ConnectionError::Spawn { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn slot_guard_clears_on_drop() {
        let slot = Arc::new(ActiveSlot::default());
        let (_tx, rx) = watch::channel(false);
        *slot.lock() = Some(ActiveProcess { pid: 42, closed: rx });
        assert_eq!(slot.pid(), Some(42));
        drop(SlotGuard(Arc::clone(&slot)));
        assert_eq!(slot.pid(), None);
    }

    #[tokio::test]
    async fn missing_binary_is_not_installed() {
        let conn = ProcessConnection::new(
            ConnectionConfig {
                binary_path: "/nonexistent/tether-agent-binary".to_string(),
                ..Default::default()
            },
            ParserConfig::default(),
        );
        let err = conn.verify_installation().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotInstalled { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn api_key_counts_as_authenticated() {
        let conn = ProcessConnection::new(
            ConnectionConfig {
                binary_path: "/nonexistent/tether-agent-binary".to_string(),
                ..Default::default()
            },
            ParserConfig::default(),
        );
        conn.set_env(API_KEY_ENV, "k");
        let status = conn.verify_auth().await.unwrap();
        assert!(status.authenticated && status.via_api_key);
    }

    #[tokio::test]
    async fn disconnect_without_a_prompt_is_a_no_op() {
        let conn = ProcessConnection::new(ConnectionConfig::default(), ParserConfig::default());
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
    }
}
