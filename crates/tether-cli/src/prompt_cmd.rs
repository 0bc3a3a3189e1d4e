//! `tether prompt`: run one turn through the cursor harness and stream the
//! agent's output to the terminal.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;

use tether_core::BridgeConfig;
use tether_core::harness::{CursorAdapter, Harness, HarnessEvent, PromptRequest};
use tether_core::translate::{SessionUpdate, ToolCallStatus};

#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    /// Prompt text; read from stdin when `None`.
    pub text: Option<String>,
    pub model: Option<String>,
    /// Emit one JSON object per event instead of plain text.
    pub json: bool,
}

/// Turns harness events into terminal output. Agent text goes to `out`,
/// tool activity and warnings to `err`.
pub struct Renderer<O, E> {
    out: O,
    err: E,
    json: bool,
    mid_line: bool,
}

impl<O: Write, E: Write> Renderer<O, E> {
    pub fn new(out: O, err: E, json: bool) -> Self {
        Self {
            out,
            err,
            json,
            mid_line: false,
        }
    }

    pub fn render(&mut self, event: &HarnessEvent) -> std::io::Result<()> {
        if self.json {
            return self.render_json(event);
        }
        match event {
            HarnessEvent::Notification(n) => match &n.update {
                SessionUpdate::AgentMessageChunk { content } => {
                    let text = content.as_text();
                    write!(self.out, "{text}")?;
                    self.out.flush()?;
                    self.mid_line = !text.ends_with('\n');
                }
                SessionUpdate::ToolCall(call) => {
                    self.break_line()?;
                    writeln!(self.err, "→ {}", call.title)?;
                }
                SessionUpdate::ToolCallUpdate(update) if update.status == ToolCallStatus::Failed => {
                    self.break_line()?;
                    writeln!(self.err, "✗ tool call {} failed", update.tool_call_id)?;
                }
                _ => {}
            },
            HarnessEvent::ResultCompleted(_) => self.break_line()?,
            HarnessEvent::Warning(message) => {
                self.break_line()?;
                writeln!(self.err, "warning: {message}")?;
            }
            HarnessEvent::TextTruncated { original_bytes, .. } => {
                self.break_line()?;
                writeln!(self.err, "warning: response truncated ({original_bytes} bytes)")?;
            }
            HarnessEvent::Stderr(chunk) => debug!(stderr = %chunk.trim_end(), "agent stderr"),
            HarnessEvent::Status(_)
            | HarnessEvent::Initialized(_)
            | HarnessEvent::ToolResultTruncated(_) => {}
        }
        Ok(())
    }

    fn render_json(&mut self, event: &HarnessEvent) -> std::io::Result<()> {
        let value = match event {
            HarnessEvent::Notification(n) => json!({ "type": "session_update", "notification": n }),
            HarnessEvent::Initialized(init) => json!({
                "type": "initialized",
                "vendorSessionId": init.session_id,
                "model": init.model,
            }),
            HarnessEvent::ResultCompleted(r) => json!({
                "type": "result",
                "vendorSessionId": r.session_id,
                "text": r.text,
                "durationMs": r.duration_ms,
                "success": r.success,
            }),
            HarnessEvent::Warning(message) => json!({ "type": "warning", "message": message }),
            _ => return Ok(()),
        };
        writeln!(self.out, "{value}")?;
        self.out.flush()
    }

    fn break_line(&mut self) -> std::io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }
}

async fn read_prompt(text: Option<String>) -> Result<String> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("failed to read prompt from stdin")?;
            buf
        }
    };
    if text.trim().is_empty() {
        bail!("prompt is empty");
    }
    Ok(text)
}

/// Run the prompt command.
pub async fn run_prompt(config: BridgeConfig, options: PromptOptions) -> Result<()> {
    let text = read_prompt(options.text).await?;
    let cwd: PathBuf = match &config.connection.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to determine the working directory")?,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let json = options.json;
    let printer = tokio::spawn(async move {
        let mut renderer = Renderer::new(std::io::stdout(), std::io::stderr(), json);
        while let Some(event) = rx.recv().await {
            if let Err(e) = renderer.render(&event) {
                debug!(error = %e, "failed to write output");
            }
        }
    });

    let adapter = CursorAdapter::new(config, tx);
    let outcome = async {
        adapter.connect().await?;
        let session = adapter.new_session(&cwd).await?;
        if let Some(model) = &options.model {
            adapter.set_session_model(&session.session_id, model).await?;
        }
        adapter
            .prompt(PromptRequest::text(session.session_id, text))
            .await
    }
    .await;
    let teardown = adapter.disconnect().await;

    // Closes the event channel so the printer drains and exits.
    drop(adapter);
    printer.await.context("output task failed")?;

    let response = outcome.context("prompt failed")?;
    teardown.context("failed to clean up after the prompt")?;
    debug!(stop_reason = ?response.stop_reason, "prompt finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tether_core::stream::ContentBlock;
    use tether_core::translate::{
        AcpToolKind, ResultCompleted, SessionNotification, ToolCall,
    };

    use super::*;

    fn note(update: SessionUpdate) -> HarnessEvent {
        HarnessEvent::Notification(SessionNotification {
            session_id: "s1".to_string(),
            update,
        })
    }

    fn render_all(events: &[HarnessEvent], json: bool) -> (String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        {
            let mut renderer = Renderer::new(&mut out, &mut err, json);
            for event in events {
                renderer.render(event).unwrap();
            }
        }
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    fn sample() -> Vec<HarnessEvent> {
        vec![
            note(SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("Looking"),
            }),
            note(SessionUpdate::ToolCall(ToolCall {
                tool_call_id: "c1".to_string(),
                title: "read_file".to_string(),
                kind: AcpToolKind::Read,
                status: ToolCallStatus::InProgress,
                raw_input: None,
            })),
            note(SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("Done."),
            }),
            HarnessEvent::ResultCompleted(ResultCompleted {
                session_id: "v1".to_string(),
                text: "Done.".to_string(),
                duration_ms: 5,
                success: true,
            }),
        ]
    }

    #[test]
    fn text_mode_separates_agent_text_from_tool_activity() {
        let (out, err) = render_all(&sample(), false);
        assert_eq!(out, "Looking\nDone.\n");
        assert_eq!(err, "→ read_file\n");
    }

    #[test]
    fn json_mode_emits_one_object_per_line() {
        let (out, err) = render_all(&sample(), true);
        assert!(err.is_empty());
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "session_update");
        assert_eq!(lines[0]["notification"]["update"]["sessionUpdate"], "agent_message_chunk");
        assert_eq!(lines[3]["type"], "result");
        assert_eq!(lines[3]["success"], true);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let err = read_prompt(Some("  \n".to_string())).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
