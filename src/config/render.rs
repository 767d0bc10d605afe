//! `ralph config` output.

use std::path::Path;

use anyhow::{Context, Result};

use super::ProjectConfig;
use crate::agent;

pub fn source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .ralph/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn timeout_label(secs: u64) -> String {
    if secs == 0 {
        "(none)".to_string()
    } else {
        format!("{secs}s")
    }
}

pub fn human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let defaults = &config.defaults;
    let mut output = String::new();
    output.push_str("Defaults\n");
    push_kv(&mut output, "agent", &defaults.agent);
    push_kv(&mut output, "failover_threshold", defaults.failover_threshold);
    push_kv(&mut output, "max_iterations", defaults.max_iterations);
    push_kv(&mut output, "rotate_at", format!("{} lines", defaults.rotate_at));
    push_kv(
        &mut output,
        "iteration_delay",
        format!("{}ms", defaults.iteration_delay_millis),
    );
    push_kv(
        &mut output,
        "invocation_timeout",
        timeout_label(defaults.invocation_timeout_secs),
    );
    output.push('\n');

    output.push_str("Backends\n");
    push_kv(&mut output, "order", config.backends.order.join(", "));
    push_kv(
        &mut output,
        "available",
        agent::known_backends(&config.backends).join(", "),
    );
    if config.backends.custom.is_empty() {
        push_kv(&mut output, "custom", "(none)");
    } else {
        for (name, backend) in &config.backends.custom {
            let mut line = backend.program.clone();
            if !backend.args.is_empty() {
                line.push(' ');
                line.push_str(&backend.args.join(" "));
            }
            output.push_str(&format!("  - {name} => {line}\n"));
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", source_label(config_path));

    output
}

pub fn json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "defaults": &config.defaults,
        "backends": {
            "order": &config.backends.order,
            "available": agent::known_backends(&config.backends),
            "custom": &config.backends.custom,
        },
        "source_path": source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_groups_sections() {
        let rendered = human(&ProjectConfig::default(), None);
        assert!(rendered.contains("Defaults"));
        assert!(rendered.contains("Backends"));
        assert!(rendered.contains("claude, opencode"));
        assert!(rendered.contains("invocation_timeout       (none)"));
        assert!(rendered.contains("(defaults, no .ralph/config.toml found)"));
    }

    #[test]
    fn human_lists_custom_backends() {
        let config: ProjectConfig = toml::from_str(
            r#"
            [backends.custom.mock]
            program = "./mock.sh"
            args = ["--quiet"]
            "#,
        )
        .unwrap();
        let rendered = human(&config, Some(Path::new("/repo/.ralph/config.toml")));
        assert!(rendered.contains("  - mock => ./mock.sh --quiet"));
        assert!(rendered.contains("/repo/.ralph/config.toml"));
    }

    #[test]
    fn json_contains_expected_fields() {
        let json = json(&ProjectConfig::default(), None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["defaults"]["agent"], "claude");
        assert_eq!(value["defaults"]["failover_threshold"], 3);
        assert_eq!(value["backends"]["order"][1], "opencode");
        assert_eq!(
            value["source_path"],
            "(defaults, no .ralph/config.toml found)"
        );
    }
}
