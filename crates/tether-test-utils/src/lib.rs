//! Shared test utilities for tether integration tests.
//!
//! Provides a scripted stand-in for the `cursor-agent` binary and a tiny
//! HTTP/1.1 client for poking the hook server.
//!
//! A [`FakeAgent`] is a POSIX `sh` script written into its own temp
//! directory. Probe subcommands print canned output; any other invocation
//! is treated as a prompt: argv, stdin and the environment are recorded
//! next to the script and the configured `stream-json` lines are printed.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Vendor session id used by the default stream.
pub const SESSION_ID: &str = "0b6b7f3e-5d8a-4c59-9a57-2f1e3c4d5a6b";

/// Chat id printed by `create-chat` unless overridden.
pub const CHAT_ID: &str = "7d2c1a90-8e4f-4b3a-a1c2-d3e4f5a6b7c8";

/// What the script does when invoked as a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptBehavior {
    /// Print the stream and exit.
    Stream,
    /// Print the stream, then block until killed.
    Hang,
    /// Like [`PromptBehavior::Hang`], with SIGTERM ignored.
    HangIgnoringTerm,
}

/// Builder for a [`FakeAgent`].
#[derive(Debug, Clone)]
pub struct FakeAgentBuilder {
    version: String,
    status: String,
    models: String,
    sessions: Vec<String>,
    chat_id: String,
    stream: Vec<String>,
    stderr: Option<String>,
    exit_code: i32,
    behavior: PromptBehavior,
    probe_delay_secs: Option<u32>,
}

impl Default for FakeAgentBuilder {
    fn default() -> Self {
        Self {
            version: "2025.09.18-39624ef".to_string(),
            status: "✓ Logged in as dev@example.com".to_string(),
            models: "Available models:\n- auto - Auto (current)\n- gpt-5 - GPT-5\n- sonnet-4 - Sonnet 4\n"
                .to_string(),
            sessions: vec![SESSION_ID.to_string()],
            chat_id: CHAT_ID.to_string(),
            stream: default_stream(SESSION_ID),
            stderr: None,
            exit_code: 0,
            behavior: PromptBehavior::Stream,
            probe_delay_secs: None,
        }
    }
}

impl FakeAgentBuilder {
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn logged_out(mut self) -> Self {
        self.status = "Not logged in. Run `cursor-agent login` first.".to_string();
        self
    }

    pub fn models(mut self, listing: &str) -> Self {
        self.models = listing.to_string();
        self
    }

    pub fn sessions(mut self, ids: &[&str]) -> Self {
        self.sessions = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn chat_id(mut self, id: &str) -> Self {
        self.chat_id = id.to_string();
        self
    }

    /// Lines printed on stdout for a prompt, one per line.
    pub fn stream(mut self, lines: Vec<String>) -> Self {
        self.stream = lines;
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = Some(text.to_string());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn behavior(mut self, behavior: PromptBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Make every probe subcommand sleep before answering.
    pub fn slow_probes(mut self, secs: u32) -> Self {
        self.probe_delay_secs = Some(secs);
        self
    }

    pub fn build(self) -> FakeAgent {
        let dir = tempfile::tempdir().expect("failed to create fake agent dir");
        let bin = dir.path().join("cursor-agent");
        let script = self.script(dir.path());
        fs::write(&bin, script).expect("failed to write fake agent script");
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755))
            .expect("failed to mark fake agent executable");
        wait_until_executable(&bin);
        FakeAgent { dir, bin }
    }

    fn script(&self, dir: &Path) -> String {
        let dir = dir.display();
        let delay = self
            .probe_delay_secs
            .map(|s| format!("sleep {s}; "))
            .unwrap_or_default();

        let mut s = String::from("#!/bin/sh\n");
        let _ = writeln!(s, "DIR='{dir}'");
        s.push_str("case \"$1\" in\n");
        s.push_str("  __ready) exit 0 ;;\n");
        let _ = writeln!(s, "  --version) {delay}echo 'cursor-agent {}'; exit 0 ;;", self.version);
        let _ = writeln!(s, "  status)\n    {delay}cat <<'TETHER_EOF'\n{}\nTETHER_EOF\n    exit 0 ;;", self.status);
        let _ = writeln!(s, "  models)\n    {delay}cat <<'TETHER_EOF'\n{}\nTETHER_EOF\n    exit 0 ;;", self.models.trim_end());
        let _ = writeln!(
            s,
            "  ls)\n    {delay}cat <<'TETHER_EOF'\n{}\nTETHER_EOF\n    exit 0 ;;",
            self.sessions
                .iter()
                .map(|id| format!("{id}  (updated just now)"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let _ = writeln!(s, "  create-chat) {delay}echo '{}'; exit 0 ;;", self.chat_id);
        s.push_str("esac\n");

        if self.behavior == PromptBehavior::HangIgnoringTerm {
            s.push_str("trap '' TERM\n");
        }
        s.push_str("printf '%s\\n' \"$@\" > \"$DIR/argv\"\n");
        s.push_str("env > \"$DIR/env\"\n");
        s.push_str("cat > \"$DIR/stdin\"\n");
        if let Some(stderr) = &self.stderr {
            let _ = writeln!(s, "cat >&2 <<'TETHER_EOF'\n{stderr}\nTETHER_EOF");
        }
        if !self.stream.is_empty() {
            let _ = writeln!(s, "cat <<'TETHER_EOF'\n{}\nTETHER_EOF", self.stream.join("\n"));
        }
        match self.behavior {
            PromptBehavior::Stream => {
                let _ = writeln!(s, "exit {}", self.exit_code);
            }
            PromptBehavior::Hang | PromptBehavior::HangIgnoringTerm => {
                s.push_str("exec sleep 30\n");
            }
        }
        s
    }
}

/// Exec the fresh script once. A concurrent fork in another test thread can
/// briefly hold the write descriptor, which makes exec fail with ETXTBSY.
fn wait_until_executable(bin: &Path) {
    for _ in 0..100 {
        match std::process::Command::new(bin).arg("__ready").status() {
            Ok(_) => return,
            Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => panic!("fake agent {} is not runnable: {e}", bin.display()),
        }
    }
    panic!("fake agent {} stayed busy", bin.display());
}

/// A fake `cursor-agent` on disk. The directory is removed on drop.
#[derive(Debug)]
pub struct FakeAgent {
    dir: TempDir,
    bin: PathBuf,
}

impl FakeAgent {
    pub fn builder() -> FakeAgentBuilder {
        FakeAgentBuilder::default()
    }

    /// Default agent: logged in, streams [`default_stream`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Absolute path of the script, for `ConnectionConfig::binary_path`.
    pub fn path(&self) -> &Path {
        &self.bin
    }

    pub fn path_str(&self) -> String {
        self.bin.display().to_string()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Arguments of the last prompt invocation, one per element.
    pub fn recorded_args(&self) -> Option<Vec<String>> {
        let raw = fs::read_to_string(self.dir.path().join("argv")).ok()?;
        Some(raw.lines().map(str::to_string).collect())
    }

    /// Everything the last prompt invocation read from stdin.
    pub fn recorded_stdin(&self) -> Option<String> {
        fs::read_to_string(self.dir.path().join("stdin")).ok()
    }

    /// Value of `key` in the last prompt invocation's environment.
    pub fn recorded_env(&self, key: &str) -> Option<String> {
        let raw = fs::read_to_string(self.dir.path().join("env")).ok()?;
        let prefix = format!("{key}=");
        raw.lines()
            .find_map(|l| l.strip_prefix(&prefix).map(str::to_string))
    }
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// stream-json lines
// ---------------------------------------------------------------------------

fn line(value: Value) -> String {
    value.to_string()
}

fn tool_body(key: &str, body: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), body);
    Value::Object(map)
}

pub fn init_line(session_id: &str) -> String {
    line(json!({
        "type": "system",
        "subtype": "init",
        "apiKeySource": "login",
        "cwd": "/workspace",
        "session_id": session_id,
        "model": "GPT-5",
        "permissionMode": "default",
    }))
}

pub fn user_line(session_id: &str, text: &str) -> String {
    line(json!({
        "type": "user",
        "session_id": session_id,
        "message": { "role": "user", "content": [{ "type": "text", "text": text }] },
    }))
}

pub fn assistant_line(session_id: &str, text: &str) -> String {
    line(json!({
        "type": "assistant",
        "session_id": session_id,
        "message": { "role": "assistant", "content": [{ "type": "text", "text": text }] },
    }))
}

pub fn tool_started_line(session_id: &str, call_id: &str, key: &str, args: Value) -> String {
    line(json!({
        "type": "tool_call",
        "subtype": "started",
        "call_id": call_id,
        "session_id": session_id,
        "tool_call": tool_body(key, json!({ "args": args })),
    }))
}

pub fn tool_completed_line(
    session_id: &str,
    call_id: &str,
    key: &str,
    args: Value,
    result: Value,
) -> String {
    line(json!({
        "type": "tool_call",
        "subtype": "completed",
        "call_id": call_id,
        "session_id": session_id,
        "tool_call": tool_body(key, json!({ "args": args, "result": result })),
    }))
}

pub fn result_line(session_id: &str, text: &str) -> String {
    line(json!({
        "type": "result",
        "subtype": "success",
        "duration_ms": 1234,
        "duration_api_ms": 1200,
        "is_error": false,
        "result": text,
        "session_id": session_id,
        "request_id": uuid::Uuid::new_v4().to_string(),
    }))
}

/// A complete turn: init, one read tool call, a reply and the result.
pub fn default_stream(session_id: &str) -> Vec<String> {
    vec![
        init_line(session_id),
        user_line(session_id, "read the readme"),
        tool_started_line(
            session_id,
            "call-1",
            "readToolCall",
            json!({ "path": "README.md" }),
        ),
        tool_completed_line(
            session_id,
            "call-1",
            "readToolCall",
            json!({ "path": "README.md" }),
            json!({ "success": { "content": "# demo\n", "totalLines": 1 } }),
        ),
        assistant_line(session_id, "The readme is a single heading."),
        result_line(session_id, "The readme is a single heading."),
    ]
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// POST `body` to `path` over a unix socket. Returns `(status, body)`.
pub async fn post_unix(socket: &Path, path: &str, body: &str) -> (u16, String) {
    let stream = tokio::net::UnixStream::connect(socket)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {}: {e}", socket.display()));
    exchange(stream, "POST", path, body).await
}

/// POST `body` to `url` (`http://127.0.0.1:<port>/<path>`).
pub async fn post_http(url: &str, body: &str) -> (u16, String) {
    let rest = url
        .strip_prefix("http://")
        .unwrap_or_else(|| panic!("not an http url: {url}"));
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let stream = tokio::net::TcpStream::connect(authority)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {authority}: {e}"));
    exchange(stream, "POST", path, body).await
}

/// Send one request with `Connection: close` and read the whole response.
pub async fn exchange<S>(mut stream: S, method: &str, path: &str, body: &str) -> (u16, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("failed to write request");

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .expect("failed to read response");
    parse_response(&String::from_utf8_lossy(&raw))
}

fn parse_response(raw: &str) -> (u16, String) {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("malformed response: {raw:?}"));
    let chunked = head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("transfer-encoding: chunked"));
    let body = if chunked { dechunk(body) } else { body.to_string() };
    (status, body)
}

fn dechunk(mut body: &str) -> String {
    let mut out = String::new();
    while let Some((size, rest)) = body.split_once("\r\n") {
        let Ok(size) = usize::from_str_radix(size.trim(), 16) else {
            break;
        };
        if size == 0 || rest.len() < size {
            break;
        }
        out.push_str(&rest[..size]);
        body = rest[size..].trim_start_matches("\r\n");
    }
    out
}
