//! Agent backend layer.
//!
//! Each coding agent (Claude Code, OpenCode, or a command declared in config)
//! is wrapped in an adapter that knows how to:
//! - Build the command that runs one invocation in a PTY
//! - Deliver the prompt (as an argument, or typed into the PTY and closed
//!   with `^D`)
//! - Reduce structured output to the text worth classifying
//! - Format operator input written to the agent's terminal
//!
//! The invoker drives adapters through this trait without knowing any agent's
//! CLI conventions.

pub mod claude;
pub mod command;
pub mod opencode;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::BackendsConfig;

/// How the prompt reaches the agent process.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    /// Appended as the last command-line argument.
    Argument,
    /// Fed to the agent's stdin from a temporary file.
    #[default]
    Stdin,
}

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// The program to execute (e.g., "claude", "opencode").
    pub program: String,
    /// Arguments to pass to the program.
    pub args: Vec<String>,
    /// Working directory for the agent process.
    pub work_dir: String,
    /// Environment variables to set (key, value pairs).
    pub env: Vec<(String, String)>,
    /// Prompt text to type into the PTY after spawn, when delivered on stdin.
    pub stdin_prompt: Option<String>,
}

/// Trait that all agent backends implement.
///
/// An adapter does not own the PTY or the process. The invoker does that. The
/// adapter only provides the configuration needed to drive the agent.
pub trait AgentAdapter: Send + Sync {
    /// Backend name as used in config, checklists, and the registry.
    fn name(&self) -> &str;

    /// Program looked up on `PATH` before spawning.
    fn program(&self) -> &str;

    /// Build the spawn configuration for one invocation.
    fn spawn_config(&self, prompt: &str, model: Option<&str>, work_dir: &Path) -> SpawnConfig;

    /// Text fed to the classifier and the completion-marker check.
    fn result_text(&self, raw_output: &str) -> String {
        raw_output.to_string()
    }

    /// Format operator text sent to the agent's terminal.
    fn format_input(&self, text: &str) -> String {
        if text.ends_with('\n') {
            text.to_string()
        } else {
            format!("{text}\n")
        }
    }
}

/// Names of the built-in backends, in default priority order.
pub const BUILTIN_BACKENDS: &[&str] = &["claude", "opencode"];

/// Look up a backend adapter by name.
///
/// Custom backends from config shadow built-ins of the same name. Returns
/// `None` when the name is unknown.
pub fn adapter_from_name(name: &str, backends: &BackendsConfig) -> Option<Box<dyn AgentAdapter>> {
    if let Some(custom) = backends.custom.get(name) {
        return Some(Box::new(command::CommandAdapter::new(name, custom.clone())));
    }
    match name {
        "claude" | "claude-code" => Some(Box::new(claude::ClaudeCodeAdapter::new(None))),
        "opencode" => Some(Box::new(opencode::OpenCodeAdapter::new(None))),
        _ => None,
    }
}

/// Every backend name the config makes available.
pub fn known_backends(backends: &BackendsConfig) -> Vec<String> {
    let mut names: Vec<String> = BUILTIN_BACKENDS.iter().map(|s| s.to_string()).collect();
    for name in backends.custom.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}
