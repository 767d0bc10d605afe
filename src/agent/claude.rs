//! Claude Code adapter.
//!
//! Targets the `claude` CLI in print mode (`--print --output-format
//! stream-json`). The run's answer is the `result` field of the final
//! `{"type":"result"}` event; everything before it is tool chatter.

use std::path::Path;

use crate::agent::{AgentAdapter, SpawnConfig};

/// Adapter for Claude Code CLI.
pub struct ClaudeCodeAdapter {
    /// Override the claude binary name/path (default: "claude").
    program: String,
}

impl ClaudeCodeAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "claude".to_string()),
        }
    }
}

impl AgentAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn spawn_config(&self, prompt: &str, model: Option<&str>, work_dir: &Path) -> SpawnConfig {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push(prompt.to_string());

        SpawnConfig {
            program: self.program.clone(),
            args,
            work_dir: work_dir.to_string_lossy().to_string(),
            env: vec![],
            stdin_prompt: None,
        }
    }

    fn result_text(&self, raw_output: &str) -> String {
        parse_stream_result(raw_output).unwrap_or_else(|| raw_output.to_string())
    }
}

/// Extract the `result` text from stream-json output, if a result event with
/// a non-empty result is present.
pub fn parse_stream_result(raw_output: &str) -> Option<String> {
    raw_output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|event| event.get("type").and_then(|t| t.as_str()) == Some("result"))
        .filter_map(|event| {
            event
                .get("result")
                .and_then(|r| r.as_str())
                .filter(|r| !r.is_empty())
                .map(str::to_string)
        })
        .last()
}
