//! The `ralph run` pipeline.
//!
//! `run` validates everything that can fail before an iteration starts
//! (checklist, settings, backend executable, duplicate session, task branch),
//! then either re-executes itself detached with `--foreground` or runs the
//! job in this process: register the session, open the control socket, run
//! the scheduler, and tear everything down with the final status.

use std::fs::OpenOptions;
use std::io::{IsTerminal, stderr, stdin};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, mpsc};

use anyhow::{Context, Result, bail};
use dialoguer::Confirm;
use tracing::{info, warn};

use crate::agent::{self, AgentAdapter};
use crate::branch::{self, BranchPlan};
use crate::config::{ProjectConfig, RunOverrides, RunSettings};
use crate::control::server::{ControlServer, JobHandle};
use crate::events::OutputHub;
use crate::interactive::OperatorQueue;
use crate::invoker::{ActiveInvocation, PtyInvoker, find_executable};
use crate::log::{ExecutionLog, LogEvent};
use crate::paths;
use crate::registry::{NewSession, Registry, SessionStatus};
use crate::scheduler::{ControlRequest, Outcome, Scheduler, SchedulerConfig};
use crate::task::{Task, TaskStore};

/// Options of `ralph run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub task_dir: PathBuf,
    pub overrides: RunOverrides,
    pub yes: bool,
    pub foreground: bool,
}

/// A validated run, ready to start.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub task_dir: PathBuf,
    pub session: String,
    pub task: Task,
    pub settings: RunSettings,
    pub branch: Option<BranchPlan>,
}

/// Validate the task directory and resolve settings. Every failure here is
/// a setup error (exit 1) raised before any iteration runs.
pub fn prepare(args: &RunArgs, config: &ProjectConfig) -> Result<PreparedRun> {
    let task_dir = args
        .task_dir
        .canonicalize()
        .with_context(|| format!("task directory not found: {}", args.task_dir.display()))?;
    let store = TaskStore::new(&task_dir);
    if !store.exists() {
        bail!("no prd.json in {}", task_dir.display());
    }
    let task = store.load()?;
    if task.user_stories.is_empty() {
        bail!("{} has no user stories", store.path().display());
    }

    let settings = RunSettings::resolve(&args.overrides, &task, config)?;
    let adapter = adapter_for(&settings.agent, config)?;
    let work_dir = paths::project_root(&task_dir);
    if find_executable(adapter.program(), &work_dir).is_none() {
        bail!(
            "backend '{}' executable not found: {} (install it or pick another with --agent)",
            settings.agent,
            adapter.program()
        );
    }
    for backend in settings.backend_order.iter().filter(|b| **b != settings.agent) {
        match agent::adapter_from_name(backend, &config.backends) {
            Some(fallback) if find_executable(fallback.program(), &work_dir).is_none() => {
                warn!(backend = %backend, program = fallback.program(), "failover backend not installed");
            }
            Some(_) => {}
            None => warn!(backend = %backend, "unknown backend in failover order"),
        }
    }

    Ok(PreparedRun {
        session: paths::session_name(&task_dir),
        branch: BranchPlan::from_task(&task, args.overrides.base_branch.as_deref()),
        task_dir,
        task,
        settings,
    })
}

fn adapter_for(name: &str, config: &ProjectConfig) -> Result<Box<dyn AgentAdapter>> {
    agent::adapter_from_name(name, &config.backends).with_context(|| {
        format!(
            "unknown backend '{name}' (known: {})",
            agent::known_backends(&config.backends).join(", ")
        )
    })
}

/// Entry point of `ralph run`. Returns the process exit code.
pub fn run(args: &RunArgs, config: &ProjectConfig, data_dir: &Path) -> Result<i32> {
    let prepared = prepare(args, config)?;
    refuse_duplicate(data_dir, &prepared.session)?;

    if args.foreground {
        setup_branch(&prepared)?;
        return run_foreground(&prepared, config, data_dir);
    }

    if !args.yes && stdin().is_terminal() && !confirm(&prepared)? {
        println!("[ralph] aborted");
        return Ok(0);
    }
    setup_branch(&prepared)?;
    let (pid, job_log) = spawn_detached(args, &prepared, data_dir)?;
    println!("[ralph] started {} in background (pid: {pid})", prepared.session);
    println!("[ralph] attach with: ralph attach {}", prepared.session);
    println!("[ralph] job log: {}", job_log.display());
    Ok(0)
}

fn setup_branch(prepared: &PreparedRun) -> Result<()> {
    let Some(plan) = &prepared.branch else {
        return Ok(());
    };
    let repo = paths::project_root(&prepared.task_dir);
    branch::setup(&repo, plan).with_context(|| format!("failed to set up branch '{}'", plan.branch))?;
    Ok(())
}

/// Push and open the pull request for a finished task. Failures are logged;
/// they never change the run's outcome.
fn complete_branch(prepared: &PreparedRun) {
    let Some(plan) = &prepared.branch else {
        return;
    };
    let repo = paths::project_root(&prepared.task_dir);
    match branch::complete(&repo, plan) {
        Ok(Some(action)) => info!(branch = %plan.branch, action = ?action, "branch completion done"),
        Ok(None) => {}
        Err(e) => warn!(branch = %plan.branch, error = %format!("{e:#}"), "branch completion failed"),
    }
}

fn refuse_duplicate(data_dir: &Path, session: &str) -> Result<()> {
    let registry = Registry::open(&paths::registry_db(data_dir))?;
    if let Some(existing) = registry.get(session)?
        && existing.status == SessionStatus::Running
    {
        bail!("session '{session}' is already running (pid {})", existing.pid);
    }
    Ok(())
}

fn confirm(prepared: &PreparedRun) -> Result<bool> {
    let task = &prepared.task;
    let prompt = format!(
        "Run {} ({}/{} stories done) with {} for up to {} iterations?",
        prepared.session,
        task.completed_count(),
        task.total_count(),
        prepared.settings.agent,
        prepared.settings.max_iterations
    );
    Ok(Confirm::new().with_prompt(prompt).default(true).interact()?)
}

/// Re-run this binary with `--foreground`, output to the session job log.
fn spawn_detached(args: &RunArgs, prepared: &PreparedRun, data_dir: &Path) -> Result<(u32, PathBuf)> {
    let exe = std::env::current_exe().context("failed to locate the ralph executable")?;
    let mut cmd = Command::new(exe);
    cmd.arg("run")
        .arg(&prepared.task_dir)
        .arg("--foreground")
        .arg("--yes");
    for arg in override_args(&args.overrides) {
        cmd.arg(arg);
    }

    let job_log = paths::job_log(data_dir, &prepared.session);
    if let Some(parent) = job_log.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let stdout_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&job_log)
        .with_context(|| format!("failed to open job log {}", job_log.display()))?;
    let stderr_log = stdout_log.try_clone()?;

    let child = cmd
        .env(paths::DATA_DIR_ENV, data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
        .context("failed to start detached job")?;
    Ok((child.id(), job_log))
}

/// CLI flags that must survive the detached re-exec.
pub fn override_args(overrides: &RunOverrides) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(agent) = &overrides.agent {
        args.extend(["--agent".to_string(), agent.clone()]);
    }
    if let Some(threshold) = overrides.failover_threshold {
        args.extend(["--failover-threshold".to_string(), threshold.to_string()]);
    }
    if let Some(iterations) = overrides.max_iterations {
        args.extend(["--iterations".to_string(), iterations.to_string()]);
    }
    if let Some(rotate_at) = overrides.rotate_at {
        args.extend(["--rotate-at".to_string(), rotate_at.to_string()]);
    }
    if let Some(timeout) = overrides.timeout_secs {
        args.extend(["--timeout".to_string(), timeout.to_string()]);
    }
    if let Some(base) = &overrides.base_branch {
        args.extend(["--base-branch".to_string(), base.clone()]);
    }
    args
}

/// Run the job in this process until a terminal state.
pub fn run_foreground(prepared: &PreparedRun, config: &ProjectConfig, data_dir: &Path) -> Result<i32> {
    let session = prepared.session.as_str();
    let db = paths::registry_db(data_dir);
    let mut registry = Registry::open(&db)?;
    registry.register(&NewSession {
        name: session.to_string(),
        task_dir: prepared.task_dir.display().to_string(),
        pid: std::process::id(),
        backend: prepared.settings.agent.clone(),
        max_iterations: prepared.settings.max_iterations,
        completed_stories: prepared.task.completed_count() as u32,
        total_stories: prepared.task.total_count() as u32,
    })?;

    let execution_log = Arc::new(ExecutionLog::new(&paths::execution_log(data_dir, session))?);
    execution_log.record(LogEvent::SessionStarted {
        session: session.to_string(),
        task_dir: prepared.task_dir.display().to_string(),
        backend: prepared.settings.agent.clone(),
        max_iterations: prepared.settings.max_iterations,
        failover_threshold: prepared.settings.failover_threshold,
    });

    let hub = OutputHub::default();
    match drive(prepared, config, data_dir, registry, &hub, Arc::clone(&execution_log)) {
        Ok((status, exit_code)) => {
            hub.close(status.as_str());
            execution_log.record(LogEvent::SessionEnded {
                status: status.as_str().to_string(),
                exit_code,
            });
            Ok(exit_code)
        }
        Err(e) => {
            // The row may still say running if setup broke before the
            // scheduler could finish it.
            match Registry::open(&db).and_then(|r| r.finish(session, SessionStatus::Failed)) {
                Ok(_) => {}
                Err(finish_err) => warn!(error = %finish_err, "failed to mark session failed"),
            }
            hub.close(SessionStatus::Failed.as_str());
            execution_log.record(LogEvent::SessionEnded {
                status: SessionStatus::Failed.as_str().to_string(),
                exit_code: 1,
            });
            Err(e)
        }
    }
}

fn drive(
    prepared: &PreparedRun,
    config: &ProjectConfig,
    data_dir: &Path,
    registry: Registry,
    hub: &OutputHub,
    execution_log: Arc<ExecutionLog>,
) -> Result<(SessionStatus, i32)> {
    let session = prepared.session.as_str();
    let active = ActiveInvocation::new();
    let queue = OperatorQueue::new();
    let (tx, rx) = mpsc::channel();

    {
        let tx = tx.clone();
        let active = active.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = tx.send(ControlRequest::Shutdown);
            active.kill();
        }) {
            warn!(error = %e, "could not install signal handler");
        }
    }

    let mut server = ControlServer::start(
        &paths::control_socket(data_dir, session),
        JobHandle {
            hub: hub.clone(),
            active: active.clone(),
            queue: queue.clone(),
            requests: tx,
            execution_log: Some(Arc::clone(&execution_log)),
        },
    )?;

    let output_log = paths::output_log(data_dir, session);
    let invoker = PtyInvoker::new(hub.clone(), active)
        .with_output_log(&output_log)?
        .with_status_line(stderr().is_terminal());

    let scheduler_config = SchedulerConfig {
        session: session.to_string(),
        task_dir: prepared.task_dir.clone(),
        data_dir: data_dir.to_path_buf(),
        settings: prepared.settings.clone(),
        backends: config.backends.clone(),
    };
    let mut scheduler = Scheduler::new(scheduler_config, invoker, rx, execution_log)?
        .with_queue(queue)
        .with_registry(registry);

    let task = &prepared.task;
    eprintln!(
        "[ralph] {session}: {}/{} stories done, agent {}, up to {} iterations",
        task.completed_count(),
        task.total_count(),
        prepared.settings.agent,
        prepared.settings.max_iterations
    );
    eprintln!("[ralph] output log: {}", output_log.display());
    info!(session, socket = %server.path().display(), "job started");

    let report = scheduler.run();
    server.shutdown();
    let report = report?;

    eprintln!(
        "[ralph] {session}: {} after {} iterations ({}/{} stories, agent {})",
        report.outcome.label(),
        report.iterations,
        report.completed,
        report.total,
        report.backend
    );
    if report.outcome == Outcome::Complete {
        complete_branch(prepared);
    }
    Ok((report.outcome.session_status(), report.outcome.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    const PRD: &str = r#"{
        "branchName": "ralph/auth",
        "description": "Login",
        "agent": "mock",
        "userStories": [
            {"id": "US-001", "title": "Form", "priority": 1, "passes": false},
            {"id": "US-002", "title": "Session", "priority": 2, "passes": false}
        ]
    }"#;

    fn project(config_toml: &str) -> (tempfile::TempDir, PathBuf, ProjectConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        let task_dir = root.join("tasks").join("auth");
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join("prd.json"), PRD).unwrap();
        let config: ProjectConfig = toml::from_str(config_toml).unwrap();
        (tmp, task_dir, config)
    }

    fn args(task_dir: &Path) -> RunArgs {
        RunArgs {
            task_dir: task_dir.to_path_buf(),
            overrides: RunOverrides::default(),
            yes: true,
            foreground: true,
        }
    }

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    #[serial]
    fn prepare_resolves_session_and_backend() {
        let (_tmp, task_dir, config) = project(
            r#"
            [backends.custom.mock]
            program = "/bin/sh"
            "#,
        );
        let prepared = prepare(&args(&task_dir), &config).unwrap();
        assert_eq!(prepared.session, "auth");
        assert_eq!(prepared.settings.agent, "mock");
        assert_eq!(prepared.task.total_count(), 2);
    }

    #[test]
    #[serial]
    fn missing_checklist_is_setup_error() {
        let (tmp, _task_dir, config) = project("");
        let empty = tmp.path().join("repo").join("tasks").join("empty");
        fs::create_dir_all(&empty).unwrap();
        let err = prepare(&args(&empty), &config).unwrap_err();
        assert!(err.to_string().contains("no prd.json"));
    }

    #[test]
    #[serial]
    fn missing_backend_executable_is_setup_error() {
        let (_tmp, task_dir, config) = project(
            r#"
            [backends.custom.mock]
            program = "ralph-test-agent-that-does-not-exist"
            "#,
        );
        let err = prepare(&args(&task_dir), &config).unwrap_err();
        assert!(err.to_string().contains("executable not found"), "{err}");
    }

    #[test]
    #[serial]
    fn unknown_backend_is_setup_error() {
        let (_tmp, task_dir, config) = project("");
        let err = prepare(&args(&task_dir), &config).unwrap_err();
        assert!(err.to_string().contains("unknown backend 'mock'"), "{err}");
    }

    #[test]
    fn override_args_round_trip_flags() {
        let overrides = RunOverrides {
            agent: Some("opencode".into()),
            failover_threshold: Some(2),
            max_iterations: Some(7),
            rotate_at: None,
            timeout_secs: Some(600),
            base_branch: Some("develop".into()),
        };
        assert_eq!(
            override_args(&overrides),
            vec![
                "--agent",
                "opencode",
                "--failover-threshold",
                "2",
                "--iterations",
                "7",
                "--timeout",
                "600",
                "--base-branch",
                "develop"
            ]
        );
    }

    /// Config with a `mock` backend that marks one story done per call.
    fn mock_agent_config(tmp: &Path, task_dir: &Path) -> ProjectConfig {
        let agent = tmp.join("mock-agent.sh");
        // Marks the first unfinished story as passing, like a real agent.
        write_script(
            &agent,
            &format!(
                "sed -i '0,/\"passes\": false/s//\"passes\": true/' {}\necho 'story done'",
                task_dir.join("prd.json").display()
            ),
        );
        let config: ProjectConfig = toml::from_str(&format!(
            r#"
            [defaults]
            iteration_delay_millis = 0

            [backends]
            order = ["mock"]

            [backends.custom.mock]
            program = "{}"
            prompt = "argument"
            "#,
            agent.display()
        ))
        .unwrap();
        config
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git").current_dir(dir).args(args).output().unwrap();
        assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Turn the project root into a repository on `main` with everything
    /// committed. False when git is unavailable.
    fn commit_project(root: &Path) -> bool {
        if Command::new("git").arg("--version").output().is_err() {
            return false;
        }
        git(root, &["init", "-q", "-b", "main"]);
        git(root, &["config", "user.email", "ralph-test@example.com"]);
        git(root, &["config", "user.name", "Ralph Test"]);
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "tasks"]);
        true
    }

    #[test]
    #[serial]
    fn foreground_run_switches_to_task_branch() {
        let (tmp, task_dir, _) = project("");
        let config = mock_agent_config(tmp.path(), &task_dir);
        let root = tmp.path().join("repo");
        if !commit_project(&root) {
            return;
        }

        let code = run(&args(&task_dir), &config, &tmp.path().join("data")).unwrap();
        assert_eq!(code, 0);
        assert_eq!(git(&root, &["branch", "--show-current"]), "ralph/auth");
        assert!(TaskStore::new(&task_dir).load().unwrap().is_complete());
    }

    #[test]
    #[serial]
    fn dirty_tree_refuses_to_start() {
        let (tmp, task_dir, _) = project("");
        let config = mock_agent_config(tmp.path(), &task_dir);
        let root = tmp.path().join("repo");
        if !commit_project(&root) {
            return;
        }
        fs::write(root.join("scratch.txt"), "wip\n").unwrap();

        let data_dir = tmp.path().join("data");
        let err = run(&args(&task_dir), &config, &data_dir).unwrap_err();
        assert!(format!("{err:#}").contains("uncommitted changes"), "{err:#}");
        assert_eq!(git(&root, &["branch", "--show-current"]), "main");
        let registry = Registry::open(&paths::registry_db(&data_dir)).unwrap();
        assert!(registry.get("auth").unwrap().is_none());
    }

    #[test]
    #[serial]
    fn foreground_run_completes_with_scripted_agent() {
        let (tmp, task_dir, _) = project("");
        let config = mock_agent_config(tmp.path(), &task_dir);

        let data_dir = tmp.path().join("data");
        let prepared = prepare(&args(&task_dir), &config).unwrap();
        let code = run_foreground(&prepared, &config, &data_dir).unwrap();
        assert_eq!(code, 0);

        let task = TaskStore::new(&task_dir).load().unwrap();
        assert!(task.is_complete());
        let registry = Registry::open(&paths::registry_db(&data_dir)).unwrap();
        assert_eq!(
            registry.get("auth").unwrap().unwrap().status,
            SessionStatus::Completed
        );
        assert!(!paths::control_socket(&data_dir, "auth").exists());
        let log = fs::read_to_string(paths::execution_log(&data_dir, "auth")).unwrap();
        assert!(log.lines().next().unwrap().contains("session_started"));
        assert!(log.lines().last().unwrap().contains("session_ended"));
    }
}
