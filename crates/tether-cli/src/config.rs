//! Configuration file management for tether.
//!
//! Provides a TOML config file at `~/.config/tether/config.toml` whose
//! `[bridge]` tables map onto [`BridgeConfig`], and a resolution chain:
//! CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use tether_core::BridgeConfig;
use tether_core::config::TransportKind;
use tether_core::ipc::Decision;

pub const CONFIG_ENV: &str = "TETHER_CONFIG";
pub const BINARY_ENV: &str = "TETHER_AGENT_BINARY";
pub const API_KEY_ENV: &str = "TETHER_API_KEY";
pub const WORKING_DIR_ENV: &str = "TETHER_WORKING_DIR";
pub const TRANSPORT_ENV: &str = "TETHER_TRANSPORT";
pub const DEFAULT_PERMISSION_ENV: &str = "TETHER_DEFAULT_PERMISSION";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Answer for permission hooks when no handler decides in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PermissionArg {
    Allow,
    Deny,
    Ask,
}

impl From<PermissionArg> for Decision {
    fn from(arg: PermissionArg) -> Self {
        match arg {
            PermissionArg::Allow => Decision::Allow,
            PermissionArg::Deny => Decision::Deny,
            PermissionArg::Ask => Decision::Ask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Auto,
    Unix,
    Http,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Auto => TransportKind::Auto,
            TransportArg::Unix => TransportKind::Unix,
            TransportArg::Http => TransportKind::Http,
        }
    }
}

/// Values given on the command line; `None` defers to the next source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub binary: Option<String>,
    pub api_key: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub transport: Option<TransportArg>,
    pub default_permission: Option<PermissionArg>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tether config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`,
/// also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

/// Config file path: `flag` > `TETHER_CONFIG` > XDG default.
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`. A missing file is `None`; an
/// unreadable or invalid one is an error.
pub fn load_config(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix, since it may hold an API key.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_enum<T: ValueEnum>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => match T::from_str(raw.trim(), true) {
            Ok(value) => Ok(Some(value)),
            Err(e) => bail!("{key}={raw:?} is invalid: {e}"),
        },
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TetherConfig {
    pub path: PathBuf,
    /// Whether `path` existed and was loaded.
    pub from_file: bool,
    pub bridge: BridgeConfig,
}

impl TetherConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - Agent binary: `--agent-binary` > `TETHER_AGENT_BINARY` > `bridge.connection.binary_path`
    /// - API key: `--api-key` > `TETHER_API_KEY` > `bridge.connection.api_key`
    /// - Working dir: `--cwd` > `TETHER_WORKING_DIR` > `bridge.connection.working_dir`
    /// - Transport: `--transport` > `TETHER_TRANSPORT` > `bridge.ipc.transport`
    /// - Default permission: `--default-permission` > `TETHER_DEFAULT_PERMISSION` > `bridge.ipc.default_permission`
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let path = config_path(overrides.config_path.as_deref());
        let file_config = load_config(&path)?;
        let from_file = file_config.is_some();
        let mut bridge = file_config.map(|c| c.bridge).unwrap_or_default();

        if let Some(binary) = overrides.binary.clone().or_else(|| env_var(BINARY_ENV)) {
            bridge.connection.binary_path = binary;
        }
        if let Some(key) = overrides.api_key.clone().or_else(|| env_var(API_KEY_ENV)) {
            bridge.connection.api_key = Some(key);
        }
        if let Some(dir) = overrides
            .working_dir
            .clone()
            .or_else(|| env_var(WORKING_DIR_ENV).map(PathBuf::from))
        {
            bridge.connection.working_dir = Some(dir);
        }

        let transport = match overrides.transport {
            Some(t) => Some(t),
            None => env_enum::<TransportArg>(TRANSPORT_ENV)?,
        };
        if let Some(transport) = transport {
            bridge.ipc.transport = transport.into();
        }

        let permission = match overrides.default_permission {
            Some(p) => Some(p),
            None => env_enum::<PermissionArg>(DEFAULT_PERMISSION_ENV)?,
        };
        if let Some(permission) = permission {
            bridge.ipc.default_permission = permission.into();
        }

        if bridge.connection.binary_path.trim().is_empty() {
            bail!("agent binary path is empty; set --agent-binary or {BINARY_ENV}");
        }

        Ok(Self {
            path,
            from_file,
            bridge,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    const ALL_ENV: [&str; 6] = [
        CONFIG_ENV,
        BINARY_ENV,
        API_KEY_ENV,
        WORKING_DIR_ENV,
        TRANSPORT_ENV,
        DEFAULT_PERMISSION_ENV,
    ];

    fn clear_env() {
        for key in ALL_ENV {
            unsafe { std::env::remove_var(key) };
        }
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut original = ConfigFile::default();
        original.bridge.connection.binary_path = "/opt/cursor/cursor-agent".to_string();
        original.bridge.ipc.default_permission = Decision::Deny;
        original.bridge.ipc.permission_timeout_ms = Some(750);
        save_config(&path, &original).unwrap();

        let loaded = load_config(&path).unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config(&path, &ConfigFile::default()).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_config(&tmp.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(tmp.path(), "[bridge\nbroken");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            "[bridge.connection]\nbinary_path = \"/from/file\"\n",
        );
        unsafe { std::env::set_var(BINARY_ENV, "/from/env") };

        let config = TetherConfig::resolve(&Overrides {
            config_path: Some(path),
            binary: Some("/from/flag".to_string()),
            default_permission: Some(PermissionArg::Ask),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.bridge.connection.binary_path, "/from/flag");
        assert_eq!(config.bridge.ipc.default_permission, Decision::Ask);
        assert!(config.from_file);

        clear_env();
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            "[bridge.connection]\nbinary_path = \"/from/file\"\napi_key = \"file-key\"\n\n\
             [bridge.ipc]\ntransport = \"unix\"\n",
        );
        unsafe { std::env::set_var(CONFIG_ENV, &path) };
        unsafe { std::env::set_var(BINARY_ENV, "/from/env") };
        unsafe { std::env::set_var(TRANSPORT_ENV, "HTTP") };
        unsafe { std::env::set_var(DEFAULT_PERMISSION_ENV, "deny") };

        let config = TetherConfig::resolve(&Overrides::default()).unwrap();
        assert_eq!(config.path, path);
        assert_eq!(config.bridge.connection.binary_path, "/from/env");
        assert_eq!(config.bridge.connection.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.bridge.ipc.transport, TransportKind::Http);
        assert_eq!(config.bridge.ipc.default_permission, Decision::Deny);

        clear_env();
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();

        let config = TetherConfig::resolve(&Overrides {
            config_path: Some(tmp.path().join("absent.toml")),
            ..Default::default()
        })
        .unwrap();
        assert!(!config.from_file);
        assert_eq!(config.bridge, BridgeConfig::default());
    }

    #[test]
    fn resolve_rejects_unknown_env_values() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var(DEFAULT_PERMISSION_ENV, "maybe") };

        let result = TetherConfig::resolve(&Overrides {
            config_path: Some(tmp.path().join("absent.toml")),
            ..Default::default()
        });
        clear_env();

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains(DEFAULT_PERMISSION_ENV), "unexpected error: {msg}");
    }

    #[test]
    fn config_path_prefers_flag_then_env() {
        let _lock = lock_env();
        clear_env();
        assert!(config_path(None).ends_with("tether/config.toml"));

        unsafe { std::env::set_var(CONFIG_ENV, "/etc/tether.toml") };
        assert_eq!(config_path(None), PathBuf::from("/etc/tether.toml"));
        assert_eq!(
            config_path(Some(Path::new("/tmp/flag.toml"))),
            PathBuf::from("/tmp/flag.toml")
        );
        clear_env();
    }
}
