//! `tether status`, `tether models` and `tether sessions`: one-shot probes
//! of the agent CLI.

use std::io::Write;

use anyhow::{Context, Result};

use tether_core::BridgeConfig;
use tether_core::connection::{AuthStatus, InstallationInfo, ModelInfo, ProcessConnection};

fn connection(config: &BridgeConfig) -> ProcessConnection {
    ProcessConnection::new(config.connection.clone(), config.parser.clone())
}

/// Show whether the agent CLI is installed and logged in.
pub async fn run_status(config: &BridgeConfig, out: &mut impl Write) -> Result<()> {
    let conn = connection(config);
    let binary = &config.connection.binary_path;

    let install = conn
        .verify_installation()
        .await
        .with_context(|| format!("cannot run `{binary}`"))?;
    let auth = conn
        .verify_auth()
        .await
        .with_context(|| format!("cannot read login status from `{binary}`"))?;

    write_status(out, binary, &install, &auth)?;
    if !auth.authenticated {
        anyhow::bail!("`{binary}` is not logged in; run `{binary} login` or set CURSOR_API_KEY");
    }
    Ok(())
}

fn write_status(
    out: &mut impl Write,
    binary: &str,
    install: &InstallationInfo,
    auth: &AuthStatus,
) -> Result<()> {
    writeln!(out, "Agent CLI: {binary} ({})", install.version)?;
    let login = match (auth.authenticated, auth.via_api_key, &auth.account) {
        (true, true, _) => "API key".to_string(),
        (true, false, Some(account)) => format!("logged in as {account}"),
        (true, false, None) => "logged in".to_string(),
        (false, _, _) => "not logged in".to_string(),
    };
    writeln!(out, "Auth: {login}")?;
    Ok(())
}

/// List the models the agent CLI offers.
pub async fn run_models(config: &BridgeConfig, out: &mut impl Write) -> Result<()> {
    let models = connection(config)
        .list_models()
        .await
        .context("failed to list models")?;
    write_models(out, &models)
}

fn write_models(out: &mut impl Write, models: &[ModelInfo]) -> Result<()> {
    if models.is_empty() {
        writeln!(out, "No models reported.")?;
        return Ok(());
    }
    let width = models.iter().map(|m| m.id.len()).max().unwrap_or(0);
    for model in models {
        let marker = if model.current { "*" } else { " " };
        match &model.name {
            Some(name) => writeln!(out, "{marker} {:<width$}  {name}", model.id)?,
            None => writeln!(out, "{marker} {}", model.id)?,
        }
    }
    Ok(())
}

/// List vendor chat ids, most recent first as the CLI reports them.
pub async fn run_sessions(config: &BridgeConfig, out: &mut impl Write) -> Result<()> {
    let sessions = connection(config)
        .list_sessions()
        .await
        .context("failed to list sessions")?;
    if sessions.is_empty() {
        writeln!(out, "No sessions.")?;
    }
    for id in sessions {
        writeln!(out, "{id}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn status_lines_describe_login() {
        let install = InstallationInfo {
            version: "2025.09.18-39624ef".to_string(),
        };
        let auth = AuthStatus {
            authenticated: true,
            account: Some("dev@example.com".to_string()),
            via_api_key: false,
        };
        let text = render(|out| write_status(out, "cursor-agent", &install, &auth));
        assert_eq!(
            text,
            "Agent CLI: cursor-agent (2025.09.18-39624ef)\nAuth: logged in as dev@example.com\n"
        );

        let text = render(|out| write_status(out, "cursor-agent", &install, &AuthStatus::default()));
        assert!(text.ends_with("Auth: not logged in\n"));
    }

    #[test]
    fn models_are_aligned_and_current_is_marked() {
        let models = vec![
            ModelInfo {
                id: "auto".to_string(),
                name: Some("Auto".to_string()),
                current: true,
            },
            ModelInfo {
                id: "sonnet-4".to_string(),
                name: None,
                current: false,
            },
        ];
        let text = render(|out| write_models(out, &models));
        assert_eq!(text, "* auto      Auto\n  sonnet-4\n");
    }
}
