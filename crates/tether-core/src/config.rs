//! Tunables for every bridge component.
//!
//! All durations are stored as integer milliseconds so the structs map
//! one-to-one onto the `[bridge]` tables of the CLI config file. Every
//! field has a default; a partial TOML table is valid.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ipc::types::Decision;

/// Default ceiling for accumulated assistant text and tool output (50 KiB).
pub const DEFAULT_MAX_TEXT_BYTES: usize = 50 * 1024;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub parser: ParserConfig,
    pub translator: TranslatorConfig,
    pub connection: ConnectionConfig,
    pub ipc: IpcConfig,
    pub retry: RetryConfig,
    pub harness: HarnessConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub max_accumulated_text_bytes: usize,
    pub backpressure_high_watermark: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_accumulated_text_bytes: DEFAULT_MAX_TEXT_BYTES,
            backpressure_high_watermark: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub tool_result_max_bytes: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            tool_result_max_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Vendor CLI binary, resolved through `$PATH` when not absolute.
    pub binary_path: String,
    /// Working directory for spawned processes. `None` inherits ours.
    pub working_dir: Option<PathBuf>,
    /// Extra environment for every spawned process.
    pub env: HashMap<String, String>,
    /// API key passed as `--api-key` when a request carries none.
    pub api_key: Option<String>,
    /// Ask the CLI for partial (delta) assistant output.
    pub stream_partial_output: bool,
    /// Timeout for one-shot probe subcommands.
    pub probe_timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL on disconnect.
    pub kill_grace_ms: u64,
    /// Bytes of stderr kept for diagnostics.
    pub stderr_buffer_bytes: usize,
    /// Capacity of the channel carrying events out of a prompt.
    pub event_channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            binary_path: "cursor-agent".to_string(),
            working_dir: None,
            env: HashMap::new(),
            api_key: None,
            stream_partial_output: true,
            probe_timeout_ms: 10_000,
            kill_grace_ms: 3_000,
            stderr_buffer_bytes: 64 * 1024,
            event_channel_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Which listener the hook server binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unix socket where available, loopback HTTP elsewhere.
    #[default]
    Auto,
    Unix,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub transport: TransportKind,
    /// Socket path; a fresh path under the temp dir when unset.
    pub socket_path: Option<PathBuf>,
    /// Loopback port for the HTTP transport; 0 picks an ephemeral port.
    pub port: u16,
    pub hook_path: String,
    pub max_body_bytes: usize,
    /// Per-request handler timeout for all categories.
    pub request_timeout_ms: u64,
    /// Overrides `request_timeout_ms` for permission-class events.
    pub permission_timeout_ms: Option<u64>,
    /// Decision used when the permission handler fails or times out.
    pub default_permission: Decision,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Auto,
            socket_path: None,
            port: 0,
            hook_path: "/hook".to_string(),
            max_body_bytes: 1024 * 1024,
            request_timeout_ms: 5_000,
            permission_timeout_ms: None,
            default_permission: Decision::Allow,
        }
    }
}

impl IpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms.unwrap_or(self.request_timeout_ms))
    }
}

/// Capped exponential backoff for retryable connection failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding the vendor hook config; `<cwd>/.cursor` when unset.
    pub hooks_dir: Option<PathBuf>,
    /// Skip writing hook files (the IPC server still runs).
    pub skip_hook_install: bool,
    /// Rule files whose text is injected at session start.
    pub project_rules: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.parser.max_accumulated_text_bytes, 51_200);
        assert_eq!(cfg.parser.backpressure_high_watermark, 128);
        assert_eq!(cfg.translator.tool_result_max_bytes, 51_200);
        assert_eq!(cfg.connection.probe_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.ipc.hook_path, "/hook");
        assert_eq!(cfg.ipc.default_permission, Decision::Allow);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: BridgeConfig = toml::from_str(
            r#"
            [ipc]
            transport = "http"
            permission_timeout_ms = 20
            default_permission = "deny"

            [connection]
            binary_path = "/opt/cursor/bin/cursor-agent"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ipc.transport, TransportKind::Http);
        assert_eq!(cfg.ipc.permission_timeout(), Duration::from_millis(20));
        assert_eq!(cfg.ipc.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.ipc.default_permission, Decision::Deny);
        assert_eq!(cfg.connection.binary_path, "/opt/cursor/bin/cursor-agent");
        assert_eq!(cfg.parser, ParserConfig::default());
    }
}
