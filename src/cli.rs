use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "ralph",
    about = "Supervised iteration loop that drives coding agents through a story checklist",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Work through a task directory's prd.json, one story per iteration
    Run {
        /// Task directory containing prd.json
        task_dir: PathBuf,

        /// Iteration budget
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Backend to start with (overrides RALPH_AGENT and the checklist)
        #[arg(long)]
        agent: Option<String>,

        /// Consecutive failures before switching backend
        #[arg(long)]
        failover_threshold: Option<u32>,

        /// Rotate progress.txt once it exceeds this many lines
        #[arg(long)]
        rotate_at: Option<usize>,

        /// Per-invocation timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Create the task branch from this branch instead of the current one
        #[arg(long)]
        base_branch: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Run in this terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// List known sessions
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stream a running session's output
    Attach {
        /// Session name or task directory (defaults to the only running session)
        task: Option<String>,

        /// Enable the operator channel (messages, checkpoints)
        #[arg(short, long)]
        interactive: bool,
    },

    /// Ask a running session to stop after the current iteration
    Checkpoint {
        /// Session name or task directory
        task: Option<String>,
    },

    /// Terminate a running session immediately
    Stop {
        /// Session name or task directory
        task: Option<String>,
    },

    /// Show resolved configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_parses_overrides() {
        let cli = Cli::try_parse_from([
            "ralph",
            "run",
            "tasks/auth",
            "-n",
            "5",
            "--agent",
            "opencode",
            "--failover-threshold",
            "2",
            "--timeout",
            "900",
            "--base-branch",
            "main",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                task_dir,
                iterations,
                agent,
                failover_threshold,
                rotate_at,
                timeout,
                base_branch,
                yes,
                foreground,
            } => {
                assert_eq!(task_dir, PathBuf::from("tasks/auth"));
                assert_eq!(iterations, Some(5));
                assert_eq!(agent.as_deref(), Some("opencode"));
                assert_eq!(failover_threshold, Some(2));
                assert_eq!(rotate_at, None);
                assert_eq!(timeout, Some(900));
                assert_eq!(base_branch.as_deref(), Some("main"));
                assert!(yes);
                assert!(!foreground);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn run_requires_task_dir() {
        assert!(Cli::try_parse_from(["ralph", "run"]).is_err());
    }

    #[test]
    fn attach_target_is_optional() {
        let cli = Cli::try_parse_from(["ralph", "attach", "-i"]).unwrap();
        match cli.command {
            Command::Attach { task, interactive } => {
                assert!(task.is_none());
                assert!(interactive);
            }
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::try_parse_from(["ralph", "status", "-vv", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Status { json: true }));
    }

    #[test]
    fn completions_reject_unknown_shell() {
        assert!(Cli::try_parse_from(["ralph", "completions", "tcsh"]).is_err());
        let cli = Cli::try_parse_from(["ralph", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Completions {
                shell: CompletionShell::Zsh
            }
        ));
    }
}
