//! OpenCode adapter.
//!
//! Runs `opencode run` non-interactively with the prompt as the message
//! argument. Tool permissions are opened up through `OPENCODE_PERMISSION`
//! since nobody is there to approve them.

use std::path::Path;

use crate::agent::{AgentAdapter, SpawnConfig};

const PERMISSION_ENV: &str = "OPENCODE_PERMISSION";
const ALLOW_ALL: &str = r#"{"*": "allow", "external_directory": "allow", "doom_loop": "allow"}"#;

/// Adapter for the OpenCode CLI.
pub struct OpenCodeAdapter {
    /// Override the opencode binary name/path (default: "opencode").
    program: String,
}

impl OpenCodeAdapter {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.unwrap_or_else(|| "opencode".to_string()),
        }
    }
}

impl AgentAdapter for OpenCodeAdapter {
    fn name(&self) -> &str {
        "opencode"
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn spawn_config(&self, prompt: &str, model: Option<&str>, work_dir: &Path) -> SpawnConfig {
        let mut args = vec!["run".to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push(prompt.to_string());

        SpawnConfig {
            program: self.program.clone(),
            args,
            work_dir: work_dir.to_string_lossy().to_string(),
            env: vec![(PERMISSION_ENV.to_string(), ALLOW_ALL.to_string())],
            stdin_prompt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_program_is_opencode() {
        let adapter = OpenCodeAdapter::new(None);
        let config = adapter.spawn_config("test", None, Path::new("/tmp"));
        assert_eq!(config.program, "opencode");
        assert_eq!(config.args, vec!["run", "test"]);
    }

    #[test]
    fn model_precedes_prompt() {
        let adapter = OpenCodeAdapter::new(None);
        let config = adapter.spawn_config("do it", Some("anthropic/sonnet"), Path::new("/w"));
        assert_eq!(config.args, vec!["run", "--model", "anthropic/sonnet", "do it"]);
    }

    #[test]
    fn permissions_are_opened() {
        let adapter = OpenCodeAdapter::new(None);
        let config = adapter.spawn_config("x", None, Path::new("/w"));
        assert!(config.env.iter().any(|(k, _)| k == PERMISSION_ENV));
    }

    #[test]
    fn output_is_classified_verbatim() {
        let adapter = OpenCodeAdapter::new(None);
        assert_eq!(adapter.result_text("all good"), "all good");
    }
}
