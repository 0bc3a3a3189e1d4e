//! Argument vector for a prompt invocation of the vendor CLI.

use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;

/// Environment variable the vendor CLI reads its API key from.
pub const API_KEY_ENV: &str = "CURSOR_API_KEY";

/// How much autonomy the agent gets for a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    #[default]
    Agent,
    Plan,
    Ask,
}

impl PromptMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptMode::Agent => "agent",
            PromptMode::Plan => "plan",
            PromptMode::Ask => "ask",
        }
    }
}

impl std::fmt::Display for PromptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(PromptMode::Agent),
            "plan" => Ok(PromptMode::Plan),
            "ask" => Ok(PromptMode::Ask),
            other => Err(format!("unknown mode {other:?} (expected agent, plan or ask)")),
        }
    }
}

/// One prompt turn to run through the vendor CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptRequest {
    /// Prompt text, written to the child's stdin.
    pub prompt: String,
    /// Vendor session to resume; falls back to the connection's last one.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub mode: Option<PromptMode>,
    /// Let the agent run commands without asking.
    pub force: bool,
    pub api_key: Option<String>,
    /// Overrides [`ConnectionConfig::stream_partial_output`].
    pub stream_partial_output: Option<bool>,
}

/// Build the argv (without the binary) for `request`.
///
/// `fallback_session` is the connection's last known vendor session id and
/// `env` its current environment, consulted for the API key.
pub fn prompt_args(
    request: &PromptRequest,
    fallback_session: Option<&str>,
    config: &ConnectionConfig,
    env: &std::collections::HashMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ];

    if request
        .stream_partial_output
        .unwrap_or(config.stream_partial_output)
    {
        args.push("--stream-partial-output".to_string());
    }

    if let Some(session) = request.session_id.as_deref().or(fallback_session) {
        args.push("--resume".to_string());
        args.push(session.to_string());
    }

    if let Some(model) = &request.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if let Some(mode) = request.mode {
        args.push("--mode".to_string());
        args.push(mode.as_str().to_string());
    }

    if request.force {
        args.push("--force".to_string());
    }

    let api_key = request
        .api_key
        .as_ref()
        .or(config.api_key.as_ref())
        .or_else(|| env.get(API_KEY_ENV));
    if let Some(key) = api_key {
        args.push("--api-key".to_string());
        args.push(key.clone());
    }

    args
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn args(request: &PromptRequest, fallback: Option<&str>) -> Vec<String> {
        prompt_args(request, fallback, &ConnectionConfig::default(), &HashMap::new())
    }

    #[test]
    fn minimal_request_streams_json() {
        let argv = args(&PromptRequest::default(), None);
        assert_eq!(
            argv,
            vec!["--print", "--output-format", "stream-json", "--stream-partial-output"]
        );
    }

    #[test]
    fn full_request_includes_every_flag() {
        let request = PromptRequest {
            prompt: "hi".to_string(),
            session_id: Some("s-1".to_string()),
            model: Some("gpt-5".to_string()),
            mode: Some(PromptMode::Plan),
            force: true,
            api_key: Some("key-123".to_string()),
            stream_partial_output: Some(false),
        };
        let argv = args(&request, Some("ignored"));
        assert_eq!(
            argv,
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--resume",
                "s-1",
                "--model",
                "gpt-5",
                "--mode",
                "plan",
                "--force",
                "--api-key",
                "key-123",
            ]
        );
    }

    #[test]
    fn resume_falls_back_to_last_known_session() {
        let argv = args(&PromptRequest::default(), Some("last"));
        let pos = argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(argv[pos + 1], "last");
    }

    #[test]
    fn api_key_comes_from_connection_env_when_request_has_none() {
        let env = HashMap::from([(API_KEY_ENV.to_string(), "from-env".to_string())]);
        let argv = prompt_args(
            &PromptRequest::default(),
            None,
            &ConnectionConfig::default(),
            &env,
        );
        assert!(argv.ends_with(&["--api-key".to_string(), "from-env".to_string()]));
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("ask".parse::<PromptMode>().unwrap(), PromptMode::Ask);
        assert!("yolo".parse::<PromptMode>().is_err());
    }
}
