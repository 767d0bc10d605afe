//! Config-declared command backend.
//!
//! Any program can stand in for an agent as long as it reads a prompt and
//! eventually exits. Mainly used for scripted agents in local testing and for
//! wrappers around CLIs without a built-in adapter.

use std::path::Path;

use crate::agent::{AgentAdapter, PromptDelivery, SpawnConfig};
use crate::config::CustomBackend;

/// Environment variable carrying the requested model, if any.
pub const MODEL_ENV: &str = "RALPH_MODEL";

pub struct CommandAdapter {
    name: String,
    backend: CustomBackend,
}

impl CommandAdapter {
    pub fn new(name: &str, backend: CustomBackend) -> Self {
        Self {
            name: name.to_string(),
            backend,
        }
    }
}

impl AgentAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn program(&self) -> &str {
        &self.backend.program
    }

    fn spawn_config(&self, prompt: &str, model: Option<&str>, work_dir: &Path) -> SpawnConfig {
        let mut args = self.backend.args.clone();
        let stdin_prompt = match self.backend.prompt {
            PromptDelivery::Argument => {
                args.push(prompt.to_string());
                None
            }
            PromptDelivery::Stdin => Some(prompt.to_string()),
        };
        let env = model
            .map(|m| vec![(MODEL_ENV.to_string(), m.to_string())])
            .unwrap_or_default();

        SpawnConfig {
            program: self.backend.program.clone(),
            args,
            work_dir: work_dir.to_string_lossy().to_string(),
            env,
            stdin_prompt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(prompt: PromptDelivery) -> CustomBackend {
        CustomBackend {
            program: "./mock-agent.sh".into(),
            args: vec!["--quiet".into()],
            prompt,
        }
    }

    #[test]
    fn stdin_delivery_keeps_prompt_out_of_args() {
        let adapter = CommandAdapter::new("mock", backend(PromptDelivery::Stdin));
        let config = adapter.spawn_config("hello", None, Path::new("/w"));
        assert_eq!(config.args, vec!["--quiet"]);
        assert_eq!(config.stdin_prompt.as_deref(), Some("hello"));
    }

    #[test]
    fn argument_delivery_appends_prompt() {
        let adapter = CommandAdapter::new("mock", backend(PromptDelivery::Argument));
        let config = adapter.spawn_config("hello", None, Path::new("/w"));
        assert_eq!(config.args, vec!["--quiet", "hello"]);
        assert!(config.stdin_prompt.is_none());
    }

    #[test]
    fn model_is_exported_through_env() {
        let adapter = CommandAdapter::new("mock", backend(PromptDelivery::Stdin));
        let config = adapter.spawn_config("x", Some("big"), Path::new("/w"));
        assert_eq!(config.env, vec![(MODEL_ENV.to_string(), "big".to_string())]);
        assert_eq!(adapter.name(), "mock");
        assert_eq!(adapter.program(), "./mock-agent.sh");
    }
}
