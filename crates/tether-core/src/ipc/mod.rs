//! Hook IPC server.
//!
//! The vendor CLI runs a shim script for each hook event; the shim POSTs the
//! event JSON here and prints whatever comes back. Every request is answered:
//! handlers race a per-category timeout and server shutdown, and anything
//! that goes wrong degrades to the category default.
//!
//! ```text
//!   shim ──POST /hook──> axum router ──> HookInput::parse ──400──> {"error"}
//!                                            │
//!                          routes[event] or category handler
//!                                            │
//!                 select { handler, timeout, shutdown } ──> validate ──> JSON
//! ```

pub mod types;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{IpcConfig, TransportKind};

pub use types::{
    ContextResponse, ContinuationResponse, Decision, HandlerError, HookCategory, HookEndpoint,
    HookEventName, HookHandler, HookHandlers, HookInput, PermissionResponse, Transport,
    handler_fn, validate_response,
};

/// Environment variable carrying the endpoint to the vendor CLI's hooks.
pub const HOOK_ENDPOINT_ENV: &str = "TETHER_HOOK_ENDPOINT";

const GENERIC_HANDLER_FAILURE: &str = "hook handler failed";

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("hook server is already running")]
    AlreadyRunning,

    #[error("unix socket transport is not available on this platform")]
    UnixUnsupported,

    #[error("failed to bind hook server on {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("hook server I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Shared by every request of one running server.
struct ServerState {
    handlers: Arc<RwLock<HookHandlers>>,
    config: IpcConfig,
    shutdown: CancellationToken,
}

impl ServerState {
    fn timeout_for(&self, category: HookCategory) -> std::time::Duration {
        match category {
            HookCategory::Permission => self.config.permission_timeout(),
            _ => self.config.request_timeout(),
        }
    }

    fn default_for(&self, category: HookCategory) -> Value {
        match category {
            HookCategory::Permission => json!({ "decision": self.config.default_permission }),
            _ => json!({}),
        }
    }

    fn handler_for(&self, event: HookEventName) -> Option<Arc<dyn HookHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .for_event(event)
    }
}

struct Running {
    endpoint: HookEndpoint,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The hook server. One per harness connection.
pub struct HookServer {
    config: IpcConfig,
    handlers: Arc<RwLock<HookHandlers>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for HookServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookServer")
            .field("transport", &self.config.transport)
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}

impl HookServer {
    pub fn new(config: IpcConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(RwLock::new(HookHandlers::default())),
            running: Mutex::new(None),
        }
    }

    /// Replace the handler table. Takes effect for the next request, also
    /// while the server is running.
    pub fn set_handlers(&self, handlers: HookHandlers) {
        debug!(?handlers, "hook handlers updated");
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) = handlers;
    }

    pub fn endpoint(&self) -> Option<HookEndpoint> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.endpoint.clone())
    }

    pub fn is_running(&self) -> bool {
        self.endpoint().is_some()
    }

    /// Router serving this server's handler table, without a listener.
    pub fn router(&self) -> Router {
        self.build_router(CancellationToken::new())
    }

    fn build_router(&self, shutdown: CancellationToken) -> Router {
        let state = Arc::new(ServerState {
            handlers: Arc::clone(&self.handlers),
            config: self.config.clone(),
            shutdown,
        });
        Router::new()
            .route(&self.config.hook_path, post(handle_hook))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    fn resolve_transport(&self) -> Result<Transport, IpcError> {
        match self.config.transport {
            TransportKind::Http => Ok(Transport::Http),
            TransportKind::Unix if cfg!(unix) => Ok(Transport::Unix),
            TransportKind::Unix => Err(IpcError::UnixUnsupported),
            TransportKind::Auto if cfg!(unix) => Ok(Transport::Unix),
            TransportKind::Auto => Ok(Transport::Http),
        }
    }

    /// Bind the listener and start serving.
    pub async fn start(&self) -> Result<HookEndpoint, IpcError> {
        if self.is_running() {
            return Err(IpcError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let app = self.build_router(shutdown.clone());
        let hook_path = self.config.hook_path.clone();

        let (endpoint, task) = match self.resolve_transport()? {
            Transport::Http => {
                let target = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.port));
                let listener = tokio::net::TcpListener::bind(target)
                    .await
                    .map_err(|source| IpcError::Bind {
                        target: target.to_string(),
                        source,
                    })?;
                let addr = listener.local_addr()?;
                let token = shutdown.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(token.cancelled_owned())
                        .await
                    {
                        warn!(error = %e, "hook server stopped with an error");
                    }
                });
                let endpoint = HookEndpoint {
                    transport: Transport::Http,
                    socket_path: None,
                    url: Some(format!("http://{addr}{hook_path}")),
                    hook_path,
                };
                (endpoint, task)
            }
            Transport::Unix => {
                let path = self
                    .config
                    .socket_path
                    .clone()
                    .unwrap_or_else(default_socket_path);
                let task = serve_unix(&path, app, shutdown.clone())?;
                let endpoint = HookEndpoint {
                    transport: Transport::Unix,
                    socket_path: Some(path),
                    url: None,
                    hook_path,
                };
                (endpoint, task)
            }
        };

        info!(endpoint = %endpoint.env_value(), transport = ?endpoint.transport, "hook server listening");
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            endpoint: endpoint.clone(),
            shutdown,
            task,
        });
        Ok(endpoint)
    }

    /// Stop accepting requests. Pending requests are answered with their
    /// category default. Idempotent.
    pub async fn stop(&self) -> Result<(), IpcError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            debug!("hook server already stopped");
            return Ok(());
        };

        running.shutdown.cancel();
        let mut task = running.task;
        let drain = self.config.request_timeout() + std::time::Duration::from_millis(250);
        if tokio::time::timeout(drain, &mut task).await.is_err() {
            warn!("hook server did not drain in time, aborting");
            task.abort();
        }

        if let Some(path) = &running.endpoint.socket_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(IpcError::Io(e)),
            }
        }
        info!("hook server stopped");
        Ok(())
    }
}

impl Drop for HookServer {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.shutdown.cancel();
            running.task.abort();
            if let Some(path) = &running.endpoint.socket_path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("tether-hook-{}.sock", uuid::Uuid::new_v4().simple()))
}

#[cfg(unix)]
fn serve_unix(
    path: &Path,
    app: Router,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, IpcError> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale hook socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(IpcError::Io(e)),
    }

    let listener = tokio::net::UnixListener::bind(path).map_err(|source| IpcError::Bind {
        target: path.display().to_string(),
        source,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!(error = %e, "hook server stopped with an error");
        }
    }))
}

#[cfg(not(unix))]
fn serve_unix(
    _path: &Path,
    _app: Router,
    _shutdown: CancellationToken,
) -> Result<JoinHandle<()>, IpcError> {
    Err(IpcError::UnixUnsupported)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, axum::Json(body)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, json!({ "error": message }))
}

async fn handle_hook(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let input = match HookInput::parse(&body) {
        Ok(input) => input,
        Err(message) => {
            debug!(%message, "rejecting hook request");
            return error_response(StatusCode::BAD_REQUEST, &message);
        }
    };

    let event = input.hook_event_name;
    let category = event.category();
    let default = state.default_for(category);

    let Some(handler) = state.handler_for(event) else {
        debug!(%event, category = category.as_str(), "no handler, answering with default");
        return json_response(StatusCode::OK, default);
    };

    let timeout = state.timeout_for(category);
    let outcome = tokio::select! {
        result = std::panic::AssertUnwindSafe(handler.handle(input)).catch_unwind() => Some(result),
        _ = tokio::time::sleep(timeout) => {
            warn!(%event, timeout_ms = timeout.as_millis() as u64, "hook handler timed out, using default");
            None
        }
        _ = state.shutdown.cancelled() => {
            warn!(%event, "hook server shutting down, using default");
            None
        }
    };

    match outcome {
        None => json_response(StatusCode::OK, default),
        Some(Ok(Ok(value))) => match validate_response(category, value) {
            Ok(value) => json_response(StatusCode::OK, value),
            Err(e) => {
                warn!(%event, error = %e, "hook handler returned an invalid response, using default");
                json_response(StatusCode::OK, default)
            }
        },
        Some(Ok(Err(err))) => {
            let status = err
                .status_code
                .filter(|code| (100..=599).contains(code))
                .and_then(|code| StatusCode::from_u16(code).ok());
            match status {
                Some(status) => {
                    warn!(%event, status = status.as_u16(), error = %err, "hook handler failed");
                    error_response(status, &err.message)
                }
                None => {
                    warn!(%event, error = %err, "hook handler failed");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_HANDLER_FAILURE)
                }
            }
        }
        Some(Err(_panic)) => {
            warn!(%event, "hook handler panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_HANDLER_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use tower::ServiceExt;

    use super::*;

    fn hook_body(event: &str) -> String {
        json!({
            "conversation_id": "conv-1",
            "generation_id": "gen-1",
            "hook_event_name": event,
            "workspace_roots": ["/work"]
        })
        .to_string()
    }

    async fn send(router: Router, method: Method, uri: &str, body: String) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, body.len())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post_event(server: &HookServer, event: &str) -> (StatusCode, Value) {
        send(server.router(), Method::POST, "/hook", hook_body(event)).await
    }

    #[tokio::test]
    async fn wrong_method_is_405_and_wrong_path_is_404() {
        let server = HookServer::new(IpcConfig::default());
        let (status, _) = send(server.router(), Method::GET, "/hook", String::new()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = send(server.router(), Method::POST, "/other", hook_body("stop")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let server = HookServer::new(IpcConfig {
            max_body_bytes: 16,
            ..Default::default()
        });
        let (status, _) = post_event(&server, "stop").await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn invalid_payload_is_400_with_message() {
        let server = HookServer::new(IpcConfig::default());
        let (status, body) =
            send(server.router(), Method::POST, "/hook", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid hook payload"));

        let (status, _) = post_event(&server, "notAnEvent").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn category_defaults_without_handlers() {
        let server = HookServer::new(IpcConfig::default());
        assert_eq!(
            post_event(&server, "preToolUse").await,
            (StatusCode::OK, json!({"decision": "allow"}))
        );
        assert_eq!(post_event(&server, "sessionStart").await, (StatusCode::OK, json!({})));
        assert_eq!(post_event(&server, "stop").await, (StatusCode::OK, json!({})));
        assert_eq!(post_event(&server, "afterFileEdit").await, (StatusCode::OK, json!({})));
    }

    #[tokio::test]
    async fn handlers_are_dispatched_by_category_and_route() {
        let server = HookServer::new(IpcConfig::default());
        server.set_handlers(HookHandlers {
            permission: Some(handler_fn(|_| async {
                Ok(json!({"decision": "ask", "reason": "check"}))
            })),
            context: Some(handler_fn(|input: HookInput| async move {
                Ok(json!({"additional_context": input.workspace_roots.join(",")}))
            })),
            continuation: Some(handler_fn(|_| async {
                Ok(json!({"followup_message": "keep going"}))
            })),
            routes: [(
                HookEventName::BeforeReadFile,
                handler_fn(|_| async { Ok(json!({"decision": "deny"})) }),
            )]
            .into(),
        });

        assert_eq!(
            post_event(&server, "beforeShellExecution").await.1,
            json!({"decision": "ask", "reason": "check"})
        );
        assert_eq!(
            post_event(&server, "beforeReadFile").await.1,
            json!({"decision": "deny"})
        );
        assert_eq!(
            post_event(&server, "sessionStart").await.1,
            json!({"additional_context": "/work"})
        );
        assert_eq!(
            post_event(&server, "subagentStop").await.1,
            json!({"followup_message": "keep going"})
        );
    }

    #[tokio::test]
    async fn invalid_handler_output_falls_back_to_default() {
        let server = HookServer::new(IpcConfig {
            default_permission: Decision::Deny,
            ..Default::default()
        });
        server.set_handlers(HookHandlers {
            permission: Some(handler_fn(|_| async { Ok(json!({"decision": "sure"})) })),
            ..Default::default()
        });
        assert_eq!(
            post_event(&server, "preToolUse").await,
            (StatusCode::OK, json!({"decision": "deny"}))
        );
    }

    #[tokio::test]
    async fn never_resolving_permission_handler_times_out_to_default() {
        let server = HookServer::new(IpcConfig {
            permission_timeout_ms: Some(20),
            default_permission: Decision::Deny,
            ..Default::default()
        });
        server.set_handlers(HookHandlers {
            permission: Some(handler_fn(|_| std::future::pending())),
            ..Default::default()
        });

        let started = Instant::now();
        let (status, body) = post_event(&server, "preToolUse").await;
        let elapsed = started.elapsed();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"decision": "deny"}));
        assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[tokio::test]
    async fn handler_errors_map_to_status_codes() {
        let server = HookServer::new(IpcConfig::default());
        server.set_handlers(HookHandlers {
            permission: Some(handler_fn(|_| async {
                Err(HandlerError::with_status(403, "forbidden by policy"))
            })),
            context: Some(handler_fn(|_| async {
                Err(HandlerError::with_status(999, "weird"))
            })),
            continuation: Some(handler_fn(|_| async { Err(HandlerError::new("boom")) })),
            ..Default::default()
        });

        assert_eq!(
            post_event(&server, "preToolUse").await,
            (StatusCode::FORBIDDEN, json!({"error": "forbidden by policy"}))
        );
        assert_eq!(
            post_event(&server, "sessionStart").await,
            (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": GENERIC_HANDLER_FAILURE}))
        );
        assert_eq!(
            post_event(&server, "stop").await.0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_500() {
        let server = HookServer::new(IpcConfig::default());
        server.set_handlers(HookHandlers {
            permission: Some(handler_fn(|_| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(json!({"decision": "allow"}))
            })),
            ..Default::default()
        });
        assert_eq!(
            post_event(&server, "preToolUse").await,
            (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": GENERIC_HANDLER_FAILURE}))
        );
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let server = HookServer::new(IpcConfig::default());
        server.stop().await.unwrap();
        assert!(!server.is_running());
    }
}
