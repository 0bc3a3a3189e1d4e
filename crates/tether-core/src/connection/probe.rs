//! Parsers for the textual output of the vendor CLI's one-shot
//! subcommands (`--version`, `status`, `models`, `ls`, `create-chat`).

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static DATED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}\.\d{1,2}\.\d{1,2}-[0-9a-f]+)").expect("valid regex"));

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bv?(\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?)").expect("valid regex")
});

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
    )
    .expect("valid regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)+").expect("valid regex")
});

/// Result of `--version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationInfo {
    pub version: String,
}

/// Result of `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub account: Option<String>,
    /// Authenticated by a configured API key rather than a login.
    pub via_api_key: bool,
}

/// One row of `models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: Option<String>,
    pub current: bool,
}

/// Pull a version string out of `--version` output.
///
/// Prefers the dated build form (`2025.09.18-39624ef`), then semver, then
/// the first non-empty line verbatim.
pub fn parse_version(output: &str) -> Option<String> {
    if let Some(caps) = DATED_VERSION.captures(output) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = SEMVER.captures(output) {
        return Some(caps[1].to_string());
    }
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Every distinct UUID in `output`, in order of first appearance.
pub fn extract_uuids(output: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in UUID.find_iter(output) {
        let id = m.as_str().to_ascii_lowercase();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

const LOGGED_OUT_PHRASES: &[&str] = &[
    "not logged in",
    "not authenticated",
    "unauthenticated",
    "login required",
    "please log in",
    "please login",
    "logged out",
    "no credentials",
];

const LOGGED_IN_PHRASES: &[&str] = &["logged in", "authenticated", "signed in"];

/// Heuristic read of `status` output. Negative phrases win over positive
/// ones because "not logged in" contains "logged in".
pub fn parse_auth_status(output: &str) -> AuthStatus {
    let lower = output.to_ascii_lowercase();
    if LOGGED_OUT_PHRASES.iter().any(|p| lower.contains(p)) {
        return AuthStatus::default();
    }
    if LOGGED_IN_PHRASES.iter().any(|p| lower.contains(p)) {
        return AuthStatus {
            authenticated: true,
            account: EMAIL.find(output).map(|m| m.as_str().to_string()),
            via_api_key: false,
        };
    }
    AuthStatus::default()
}

/// Parse the model listing. Accepts `id - Name (current)` lines and
/// `| id | Name |` table rows; headers, rules and prose are skipped.
pub fn parse_model_list(output: &str) -> Vec<ModelInfo> {
    output.lines().filter_map(parse_model_line).collect()
}

fn parse_model_line(line: &str) -> Option<ModelInfo> {
    let line = line
        .trim()
        .trim_start_matches(['-', '*', '•'])
        .trim_start();
    if line.is_empty() || line.chars().all(|c| "-=|+: ".contains(c)) {
        return None;
    }
    let lower = line.to_ascii_lowercase();
    if lower.starts_with("available models") || lower.ends_with(':') {
        return None;
    }

    let current = lower.contains("(current)") || lower.contains("(default)");
    let cleaned = line
        .replace("(current)", "")
        .replace("(default)", "")
        .replace("(Current)", "")
        .replace("(Default)", "");

    let (id, name) = if cleaned.contains('|') {
        let mut cells = cleaned
            .split('|')
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let id = cells.next()?.to_string();
        (id, cells.next().map(str::to_string))
    } else if let Some((id, name)) = cleaned.split_once(" - ") {
        (id.trim().to_string(), Some(name.trim().to_string()))
    } else {
        (cleaned.trim().to_string(), None)
    };

    if id.is_empty() || id.contains(char::is_whitespace) {
        return None;
    }
    if id.eq_ignore_ascii_case("id") || id.eq_ignore_ascii_case("model") {
        return None;
    }

    Some(ModelInfo {
        id,
        name: name.filter(|n| !n.is_empty()),
        current,
    })
}
