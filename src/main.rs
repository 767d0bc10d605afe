use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ralph_cli::cli::{Cli, Command};
use ralph_cli::config::{ProjectConfig, RunOverrides, render};
use ralph_cli::job::{self, RunArgs};
use ralph_cli::{control, paths, shell_completion};

fn main() {
    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let quiet = matches!(
        &cli.command,
        Command::Config { .. } | Command::Status { json: true } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if quiet => "ralph=warn,ralph_cli=warn",
        0 => "ralph=info,ralph_cli=info",
        1 => "ralph=debug,ralph_cli=debug",
        _ => "ralph=trace,ralph_cli=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .ralph/config.toml found, using defaults"),
    }
    let data_dir = paths::data_dir();

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
            let args = RunArgs {
                task_dir,
                overrides: RunOverrides {
                    agent,
                    failover_threshold,
                    max_iterations: iterations,
                    rotate_at,
                    timeout_secs: timeout,
                    base_branch,
                },
                yes,
                foreground,
            };
            return job::run(&args, &config, &data_dir);
        }
        Command::Status { json } => {
            println!("{}", control::status(&data_dir, json)?);
        }
        Command::Attach { task, interactive } => {
            control::attach(&data_dir, task.as_deref(), interactive)?;
        }
        Command::Checkpoint { task } => {
            println!("{}", control::checkpoint(&data_dir, task.as_deref())?);
        }
        Command::Stop { task } => {
            println!("{}", control::stop(&data_dir, task.as_deref())?);
        }
        Command::Config { json } => {
            if json {
                println!("{}", render::json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render::human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => shell_completion::print(shell)?,
    }

    Ok(0)
}
