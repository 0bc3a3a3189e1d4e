//! Installation of the vendor CLI's hook configuration.
//!
//! The vendor CLI reads `<dir>/hooks.json` and runs the listed command for
//! each hook event. Installation merges one entry per event pointing at a
//! generated shim script that forwards the event to the hook IPC server.
//!
//! Prior file bytes are kept in memory and in an on-disk restore record,
//! written before anything else is touched, so cleanup (or the next install
//! after a crash) puts back exactly what was there. A record whose owner
//! is still running is never applied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::ipc::{Decision, HOOK_ENDPOINT_ENV, HookCategory, HookEndpoint, HookEventName, Transport};

pub const HOOKS_DIR: &str = ".cursor";
pub const HOOKS_FILE: &str = "hooks.json";
pub const SHIM_FILE: &str = "tether-hook.sh";
pub const RESTORE_FILE: &str = "tether-hooks.restore.json";

const RECORD_VERSION: u32 = 1;

/// Restore records owned by installations alive in this process.
static LIVE_RECORDS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

#[derive(Debug, thiserror::Error)]
pub enum HookInstallError {
    #[error("existing hook config {path} is not valid JSON: {source}")]
    InvalidExisting {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("existing hook config {path} has an unexpected shape: {message}")]
    UnexpectedShape { path: PathBuf, message: String },

    #[error(
        "hook config in {dir} is in use by another tether session (pid {pid}). \
         Disconnect it first, or delete {record} if that process is not tether"
    )]
    InUse { dir: PathBuf, record: PathBuf, pid: u32 },

    #[error("restore record {path} is unreadable: {message}")]
    CorruptRecord { path: PathBuf, message: String },

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> HookInstallError {
    let path = path.to_path_buf();
    move |source| HookInstallError::Io {
        action,
        path,
        source,
    }
}

/// Files an installation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub shim: PathBuf,
    pub record: PathBuf,
}

impl HookPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            config: dir.join(HOOKS_FILE),
            shim: dir.join(SHIM_FILE),
            record: dir.join(RESTORE_FILE),
            dir,
        }
    }

    /// `<workspace>/.cursor`.
    pub fn for_workspace(workspace: &Path) -> Self {
        Self::in_dir(workspace.join(HOOKS_DIR))
    }
}

/// What to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub events: Vec<HookEventName>,
    /// Per-hook timeout written into the config, in seconds.
    pub timeout_secs: u64,
    /// Printed by the shim for permission events when the bridge is
    /// unreachable.
    pub fallback_decision: Decision,
}

impl Default for InstallOptions {
    /// Every event that expects an answer; observation events are left out.
    fn default() -> Self {
        Self {
            events: HookEventName::ALL
                .into_iter()
                .filter(|e| e.category() != HookCategory::Observation)
                .collect(),
            timeout_secs: 10,
            fallback_decision: Decision::Allow,
        }
    }
}

/// On-disk copy of what cleanup needs, for recovery after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RestoreRecord {
    version: u32,
    config_path: PathBuf,
    shim_path: PathBuf,
    /// Hex of the prior config bytes; `None` when there was no file.
    previous_config_hex: Option<String>,
    created_dir: bool,
    pid: u32,
    installed_at: DateTime<Utc>,
}

/// A live hook installation. Dropping it without calling
/// [`HookInstallation::cleanup`] restores on a best-effort basis.
#[derive(Debug)]
pub struct HookInstallation {
    pub paths: HookPaths,
    pub previous_raw_config: Option<Vec<u8>>,
    pub generated_command: String,
    pub generated_config: Value,
    created_dir: bool,
    cleaned: bool,
}

impl HookInstallation {
    /// Merge hook entries for `endpoint` into the config in `paths.dir`.
    ///
    /// A restore record left behind by an earlier crashed session is
    /// applied first. Fails with [`HookInstallError::InUse`] while another
    /// session's installation is live in the same directory.
    pub fn install(
        paths: HookPaths,
        endpoint: &HookEndpoint,
        options: &InstallOptions,
    ) -> Result<Self, HookInstallError> {
        if recover(&paths)? {
            warn!(dir = %paths.dir.display(), "restored hook config left by an earlier session");
        }

        let previous = match fs::read(&paths.config) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err("read", &paths.config)(e)),
        };

        let generated_command = paths.shim.display().to_string();
        let generated_config = merge_config(
            &paths.config,
            previous.as_deref(),
            &generated_command,
            options,
        )?;

        let created_dir = !paths.dir.exists();
        if created_dir {
            fs::create_dir_all(&paths.dir).map_err(io_err("create", &paths.dir))?;
        }

        let record = RestoreRecord {
            version: RECORD_VERSION,
            config_path: paths.config.clone(),
            shim_path: paths.shim.clone(),
            previous_config_hex: previous.as_deref().map(hex::encode),
            created_dir,
            pid: std::process::id(),
            installed_at: Utc::now(),
        };
        let record_json = serde_json::to_vec_pretty(&record).map_err(|e| {
            HookInstallError::CorruptRecord {
                path: paths.record.clone(),
                message: e.to_string(),
            }
        })?;
        write_atomic(&paths.record, &record_json)?;
        set_live(&paths.record, true);

        let installation = Self {
            paths,
            previous_raw_config: previous,
            generated_command,
            generated_config,
            created_dir,
            cleaned: false,
        };

        installation.write_files(endpoint, options)?;
        info!(
            config = %installation.paths.config.display(),
            events = options.events.len(),
            "hook config installed"
        );
        Ok(installation)
    }

    fn write_files(
        &self,
        endpoint: &HookEndpoint,
        options: &InstallOptions,
    ) -> Result<(), HookInstallError> {
        let shim = shim_script(endpoint, options);
        fs::write(&self.paths.shim, shim).map_err(io_err("write", &self.paths.shim))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.paths.shim, fs::Permissions::from_mode(0o755))
                .map_err(io_err("chmod", &self.paths.shim))?;
        }

        let mut rendered = serde_json::to_vec_pretty(&self.generated_config).map_err(|e| {
            HookInstallError::UnexpectedShape {
                path: self.paths.config.clone(),
                message: e.to_string(),
            }
        })?;
        rendered.push(b'\n');
        write_atomic(&self.paths.config, &rendered)
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Put the config back exactly as it was and remove generated files.
    /// Idempotent.
    pub fn cleanup(&mut self) -> Result<(), HookInstallError> {
        if self.cleaned {
            return Ok(());
        }
        restore(
            &self.paths,
            self.previous_raw_config.as_deref(),
            self.created_dir,
        )?;
        set_live(&self.paths.record, false);
        self.cleaned = true;
        info!(config = %self.paths.config.display(), "hook config restored");
        Ok(())
    }
}

impl Drop for HookInstallation {
    fn drop(&mut self) {
        if !self.cleaned {
            if let Err(e) = self.cleanup() {
                warn!(error = %e, "hook cleanup on drop failed");
            }
        }
    }
}

fn set_live(record: &Path, live: bool) {
    let mut records = LIVE_RECORDS.lock().unwrap_or_else(PoisonError::into_inner);
    records.retain(|p| p != record);
    if live {
        records.push(record.to_path_buf());
    }
}

/// Whether the installation that wrote `record` may still be using it.
fn owner_alive(pid: u32, record: &Path) -> bool {
    if pid == std::process::id() {
        return LIVE_RECORDS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| p == record);
    }
    process_alive(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence only. EPERM means it exists under another user.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Apply a restore record left in `paths.dir`, if any. Returns whether one
/// was found. A record whose owning process is still alive is refused with
/// [`HookInstallError::InUse`].
pub fn recover(paths: &HookPaths) -> Result<bool, HookInstallError> {
    let raw = match fs::read(&paths.record) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err("read", &paths.record)(e)),
    };

    let corrupt = |message: String| HookInstallError::CorruptRecord {
        path: paths.record.clone(),
        message,
    };
    let record: RestoreRecord = serde_json::from_slice(&raw).map_err(|e| corrupt(e.to_string()))?;
    if record.version != RECORD_VERSION {
        return Err(corrupt(format!("unsupported version {}", record.version)));
    }
    let previous = record
        .previous_config_hex
        .as_deref()
        .map(hex::decode)
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    if owner_alive(record.pid, &paths.record) {
        return Err(HookInstallError::InUse {
            dir: paths.dir.clone(),
            record: paths.record.clone(),
            pid: record.pid,
        });
    }

    debug!(
        pid = record.pid,
        installed_at = %record.installed_at,
        "applying stale hook restore record"
    );
    let recorded = HookPaths {
        dir: paths.dir.clone(),
        config: record.config_path,
        shim: record.shim_path,
        record: paths.record.clone(),
    };
    restore(&recorded, previous.as_deref(), record.created_dir)?;
    Ok(true)
}

fn restore(
    paths: &HookPaths,
    previous: Option<&[u8]>,
    created_dir: bool,
) -> Result<(), HookInstallError> {
    match previous {
        Some(bytes) => fs::write(&paths.config, bytes).map_err(io_err("restore", &paths.config))?,
        None => remove_if_exists(&paths.config)?,
    }
    remove_if_exists(&paths.shim)?;
    remove_if_exists(&paths.record)?;
    if created_dir {
        // Only succeeds when empty; anything else written there stays.
        if let Err(e) = fs::remove_dir(&paths.dir) {
            debug!(dir = %paths.dir.display(), error = %e, "hook dir left in place");
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), HookInstallError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("remove", path)(e)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), HookInstallError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    fs::write(&tmp, bytes).map_err(io_err("write", &tmp))?;
    fs::rename(&tmp, path).map_err(io_err("rename", path))
}

/// Merge our entries into the existing config without touching anything
/// else. Entries already pointing at `command` are not duplicated.
fn merge_config(
    path: &Path,
    previous: Option<&[u8]>,
    command: &str,
    options: &InstallOptions,
) -> Result<Value, HookInstallError> {
    let shape = |message: &str| HookInstallError::UnexpectedShape {
        path: path.to_path_buf(),
        message: message.to_string(),
    };

    let mut root = match previous {
        Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
            serde_json::from_slice::<Value>(bytes).map_err(|source| {
                HookInstallError::InvalidExisting {
                    path: path.to_path_buf(),
                    source,
                }
            })?
        }
        _ => json!({}),
    };

    let obj = root
        .as_object_mut()
        .ok_or_else(|| shape("top level is not an object"))?;
    obj.entry("version").or_insert(json!(1));
    let hooks = obj
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| shape("`hooks` is not an object"))?;

    for event in &options.events {
        let entries = hooks
            .entry(event.as_str())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| shape(&format!("`hooks.{event}` is not an array")))?;
        let present = entries
            .iter()
            .any(|e| e.get("command").and_then(Value::as_str) == Some(command));
        if !present {
            entries.push(json!({ "command": command, "timeout": options.timeout_secs }));
        }
    }
    Ok(root)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// POSIX sh shim: forwards stdin to the endpoint and prints the reply, or
/// the event's default when the bridge cannot be reached.
fn shim_script(endpoint: &HookEndpoint, options: &InstallOptions) -> String {
    let permission_events: Vec<&str> = HookEventName::ALL
        .into_iter()
        .filter(|e| e.category() == HookCategory::Permission)
        .map(HookEventName::as_str)
        .collect();
    let fallback_permission = json!({ "decision": options.fallback_decision }).to_string();
    let baked = match endpoint.transport {
        Transport::Unix => endpoint.env_value(),
        Transport::Http => endpoint.url.clone().unwrap_or_default(),
    };
    let max_time = options.timeout_secs.max(1);

    format!(
        r#"#!/bin/sh
# Generated by tether. Removed when the session disconnects.
endpoint="${{{env}:-{baked}}}"
input=$(cat)
event=$(printf '%s' "$input" | sed -n 's/.*"hook_event_name"[[:space:]]*:[[:space:]]*"\([A-Za-z]*\)".*/\1/p' | head -n 1)
fallback='{{}}'
case "$event" in
  {permission_events}) fallback={fallback_permission} ;;
esac
case "$endpoint" in
  http://*|https://*)
    response=$(printf '%s' "$input" | curl -sf --max-time {max_time} -X POST -H 'Content-Type: application/json' --data-binary @- "$endpoint" 2>/dev/null)
    status=$?
    ;;
  *)
    response=$(printf '%s' "$input" | curl -sf --max-time {max_time} -X POST -H 'Content-Type: application/json' --data-binary @- --unix-socket "$endpoint" {url} 2>/dev/null)
    status=$?
    ;;
esac
if [ "$status" -eq 0 ] && [ -n "$response" ]; then
  printf '%s\n' "$response"
else
  printf '%s\n' "$fallback"
fi
"#,
        env = HOOK_ENDPOINT_ENV,
        baked = baked.replace('"', r#"\""#),
        permission_events = permission_events.join("|"),
        fallback_permission = shell_quote(&fallback_permission),
        url = shell_quote(&format!("http://localhost{}", endpoint.hook_path)),
    )
}
