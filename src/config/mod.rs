use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::agent::PromptDelivery;
use crate::progress::MIN_ROTATE_AT;
use crate::task::Task;

pub mod render;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ralph";

pub const AGENT_ENV: &str = "RALPH_AGENT";
pub const FAILOVER_THRESHOLD_ENV: &str = "RALPH_FAILOVER_THRESHOLD";

pub const DEFAULT_AGENT: &str = "claude";
pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_rotate_at")]
    pub rotate_at: usize,
    #[serde(default = "default_iteration_delay_millis")]
    pub iteration_delay_millis: u64,
    /// Per-invocation wall clock limit. Zero disables it.
    #[serde(default)]
    pub invocation_timeout_secs: u64,
}

fn default_agent() -> String {
    DEFAULT_AGENT.to_string()
}

fn default_failover_threshold() -> u32 {
    DEFAULT_FAILOVER_THRESHOLD
}

fn default_max_iterations() -> u32 {
    10
}

fn default_rotate_at() -> usize {
    300
}

fn default_iteration_delay_millis() -> u64 {
    2000
}

fn default_backend_order() -> Vec<String> {
    vec!["claude".to_string(), "opencode".to_string()]
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            failover_threshold: default_failover_threshold(),
            max_iterations: default_max_iterations(),
            rotate_at: default_rotate_at(),
            iteration_delay_millis: default_iteration_delay_millis(),
            invocation_timeout_secs: 0,
        }
    }
}

/// A backend declared entirely in configuration.
///
/// ```toml
/// [backends.custom.mock]
/// program = "./mock-agent.sh"
/// args = ["--quiet"]
/// prompt = "stdin"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CustomBackend {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt: PromptDelivery,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    /// Failover priority order.
    #[serde(default = "default_backend_order")]
    pub order: Vec<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, CustomBackend>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            order: default_backend_order(),
            custom: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub backends: BackendsConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ralph/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

/// Values given on the `run` command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub agent: Option<String>,
    pub failover_threshold: Option<u32>,
    pub max_iterations: Option<u32>,
    pub rotate_at: Option<usize>,
    pub timeout_secs: Option<u64>,
    /// Base for creating the task branch when it does not exist yet.
    pub base_branch: Option<String>,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub agent: String,
    pub failover_threshold: u32,
    pub max_iterations: u32,
    pub rotate_at: usize,
    pub iteration_delay_millis: u64,
    pub invocation_timeout_secs: Option<u64>,
    pub backend_order: Vec<String>,
}

impl RunSettings {
    /// Resolve from the process environment.
    pub fn resolve(cli: &RunOverrides, task: &Task, config: &ProjectConfig) -> Result<Self> {
        Self::resolve_with_env(cli, task, config, |key| std::env::var(key).ok())
    }

    /// Backend and threshold follow CLI flag, environment, checklist field,
    /// config file, hard default. The remaining knobs skip the environment and
    /// checklist layers.
    pub fn resolve_with_env(
        cli: &RunOverrides,
        task: &Task,
        config: &ProjectConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_agent = env(AGENT_ENV).filter(|v| !v.trim().is_empty());
        let agent = cli
            .agent
            .clone()
            .or(env_agent)
            .or_else(|| task.agent.clone())
            .unwrap_or_else(|| config.defaults.agent.clone());

        let env_threshold = match env(FAILOVER_THRESHOLD_ENV).filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u32>()
                    .with_context(|| format!("{FAILOVER_THRESHOLD_ENV} must be a number, got '{raw}'"))?,
            ),
            None => None,
        };
        let failover_threshold = cli
            .failover_threshold
            .or(env_threshold)
            .or(task.failover_threshold)
            .unwrap_or(config.defaults.failover_threshold);
        if failover_threshold == 0 {
            bail!("failover threshold must be at least 1");
        }

        let max_iterations = cli.max_iterations.unwrap_or(config.defaults.max_iterations);
        if max_iterations == 0 {
            bail!("iteration budget must be at least 1");
        }

        let rotate_at = cli.rotate_at.unwrap_or(config.defaults.rotate_at);
        if rotate_at < MIN_ROTATE_AT {
            bail!("progress rotation threshold must be at least {MIN_ROTATE_AT} lines, got {rotate_at}");
        }
        let timeout = cli
            .timeout_secs
            .unwrap_or(config.defaults.invocation_timeout_secs);

        let mut backend_order = config.backends.order.clone();
        if backend_order.is_empty() {
            backend_order = default_backend_order();
        }
        if !backend_order.contains(&agent) {
            backend_order.insert(0, agent.clone());
        }

        Ok(Self {
            agent,
            failover_threshold,
            max_iterations,
            rotate_at,
            iteration_delay_millis: config.defaults.iteration_delay_millis,
            invocation_timeout_secs: (timeout > 0).then_some(timeout),
            backend_order,
        })
    }
}
