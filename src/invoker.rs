//! Agent invocation in a PTY.
//!
//! One call to [`Invoke::invoke`] runs one agent process to completion:
//! spawn in a PTY, deliver the prompt, drain and tee output, honour an
//! optional wall-clock limit, and hand back what happened. Abnormal outcomes
//! (crashes, kills, provider errors) come back as exit code and output for
//! the classifier. Only problems that make retrying pointless are errors.
//!
//! While an invocation runs, its terminal input and kill switch are published
//! in an [`ActiveInvocation`] slot so the control server can inject operator
//! text or end the process.

use std::fs::{File, OpenOptions};
use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::AgentAdapter;
use crate::display::{DisplayGate, Spinner, StatusIndicator, StatusLine, format_elapsed};
use crate::events::{ActivityExtractor, OutputHub, Utf8Stream};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to keep draining output after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Exit code reported for invocations killed by the wall-clock limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the program could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
/// Runs the agent with stdin redirected from `$RALPH_PROMPT_FILE`; `$0` is
/// the program and `$@` its arguments.
const STDIN_FROM_PROMPT_FILE: &str = r#"exec "$0" "$@" < "$RALPH_PROMPT_FILE""#;
const PROMPT_FILE_ENV: &str = "RALPH_PROMPT_FILE";
const SHELL: &str = "/bin/sh";

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("backend '{backend}' executable not found: {program}")]
    MissingExecutable { backend: String, program: String },
    #[error("failed to set up terminal for backend '{backend}': {reason}")]
    Terminal { backend: String, reason: String },
}

/// Inputs for one invocation.
pub struct InvokeRequest<'a> {
    pub adapter: Arc<dyn AgentAdapter>,
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub work_dir: &'a Path,
    pub timeout: Option<Duration>,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub backend: String,
    pub exit_code: i32,
    /// Everything the agent wrote, lossily decoded.
    pub output: String,
    /// The part worth classifying (Claude's final result, else `output`).
    pub result_text: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Killed on operator request.
    pub killed: bool,
    /// Operator text written to the agent's terminal, in order.
    pub operator_inputs: Vec<String>,
    /// Prompt fed to the agent's stdin, when delivered that way.
    pub stdin_prompt: Option<String>,
}

/// Seam between the scheduler and whatever runs agents.
pub trait Invoke {
    fn invoke(&mut self, request: &InvokeRequest<'_>) -> Result<Invocation, InvokeError>;
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

struct InputHandle {
    writer: SharedWriter,
    killer: Box<dyn ChildKiller + Send + Sync>,
    adapter: Arc<dyn AgentAdapter>,
    inputs: Vec<String>,
    killed: bool,
}

/// Shared slot describing the invocation currently in flight, if any.
#[derive(Clone, Default)]
pub struct ActiveInvocation {
    slot: Arc<Mutex<Option<InputHandle>>>,
}

impl ActiveInvocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Write operator text to the running agent.
    ///
    /// Returns `Ok(false)` when no invocation is running; the caller decides
    /// whether to queue the text.
    pub fn send_input(&self, text: &str) -> Result<bool> {
        let (writer, formatted) = {
            let mut slot = self.slot.lock().unwrap();
            let Some(handle) = slot.as_mut() else {
                return Ok(false);
            };
            handle.inputs.push(text.to_string());
            (handle.writer.clone(), handle.adapter.format_input(text))
        };
        let mut writer = writer.lock().unwrap();
        writer
            .write_all(formatted.as_bytes())
            .and_then(|_| writer.flush())
            .context("failed to write to agent terminal")?;
        Ok(true)
    }

    /// Kill the running agent. Returns false when nothing was running.
    pub fn kill(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        let Some(handle) = slot.as_mut() else {
            return false;
        };
        handle.killed = true;
        if let Err(e) = handle.killer.kill() {
            debug!(error = %e, "kill of agent process failed (likely already exited)");
        }
        true
    }

    fn install(&self, handle: InputHandle) {
        *self.slot.lock().unwrap() = Some(handle);
    }

    fn take(&self) -> Option<InputHandle> {
        self.slot.lock().unwrap().take()
    }
}

/// Locate `program` the way a shell would. Paths containing a separator are
/// taken relative to `work_dir`; bare names are searched on `PATH`.
pub fn find_executable(program: &str, work_dir: &Path) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') {
        let path = Path::new(program);
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            work_dir.join(path)
        };
        return is_executable(&candidate).then_some(candidate);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs agents in a PTY, teeing output to the session log and live hub.
pub struct PtyInvoker {
    hub: OutputHub,
    active: ActiveInvocation,
    output_log: Option<File>,
    show_status: bool,
    gate: DisplayGate,
    rows: u16,
    cols: u16,
}

impl PtyInvoker {
    pub fn new(hub: OutputHub, active: ActiveInvocation) -> Self {
        Self {
            hub,
            active,
            output_log: None,
            show_status: std::io::stderr().is_terminal(),
            gate: DisplayGate::new(),
            rows: 40,
            cols: 200,
        }
    }

    fn pty_size(&self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Append raw agent output to `path`.
    pub fn with_output_log(mut self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open output log {}", path.display()))?;
        self.output_log = Some(file);
        Ok(self)
    }

    pub fn with_status_line(mut self, show: bool) -> Self {
        self.show_status = show;
        self
    }

    fn tee(&mut self, chunk: &[u8]) {
        if let Some(log) = self.output_log.as_mut() {
            if let Err(e) = log.write_all(chunk) {
                warn!(error = %e, "failed to append to output log");
            }
        }
        self.hub.publish_output(chunk);
    }
}

/// Write the prompt (newline-terminated) to a temp file removed on drop.
fn write_prompt_file(prompt: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ralph-prompt-")
        .suffix(".txt")
        .tempfile()
        .context("failed to create prompt file")?;
    file.write_all(prompt.as_bytes())?;
    if !prompt.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush().context("failed to write prompt file")?;
    Ok(file)
}

fn spawn_failure(backend: &str, start: Instant, reason: String) -> Invocation {
    warn!(backend, %reason, "agent failed to start");
    Invocation {
        backend: backend.to_string(),
        exit_code: SPAWN_FAILURE_EXIT_CODE,
        output: reason.clone(),
        result_text: reason,
        elapsed: start.elapsed(),
        ..Default::default()
    }
}

impl Invoke for PtyInvoker {
    fn invoke(&mut self, request: &InvokeRequest<'_>) -> Result<Invocation, InvokeError> {
        let adapter = request.adapter.clone();
        let backend = adapter.name().to_string();
        let program = find_executable(adapter.program(), request.work_dir).ok_or_else(|| {
            InvokeError::MissingExecutable {
                backend: backend.clone(),
                program: adapter.program().to_string(),
            }
        })?;

        let spawn = adapter.spawn_config(request.prompt, request.model, request.work_dir);
        let terminal_err = |e: anyhow::Error| InvokeError::Terminal {
            backend: backend.clone(),
            reason: format!("{e:#}"),
        };

        let pair = native_pty_system()
            .openpty(self.pty_size())
            .map_err(terminal_err)?;

        // A prompt typed into the terminal is cut at the line discipline's
        // canonical line limit (4095 bytes), so stdin prompts come from a file.
        let prompt_file = match spawn.stdin_prompt.as_deref() {
            Some(prompt) => Some(write_prompt_file(prompt).map_err(terminal_err)?),
            None => None,
        };
        let mut cmd = match &prompt_file {
            Some(file) => {
                let mut cmd = CommandBuilder::new(SHELL);
                cmd.arg("-c");
                cmd.arg(STDIN_FROM_PROMPT_FILE);
                cmd.arg(&program);
                cmd.env(PROMPT_FILE_ENV, file.path());
                cmd
            }
            None => CommandBuilder::new(&program),
        };
        for arg in &spawn.args {
            cmd.arg(arg);
        }
        cmd.cwd(&spawn.work_dir);
        for (key, val) in &spawn.env {
            cmd.env(key, val);
        }

        info!(
            backend = %backend,
            program = %program.display(),
            work_dir = %spawn.work_dir,
            "spawning agent in PTY"
        );

        let start = Instant::now();
        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => return Ok(spawn_failure(&backend, start, format!("failed to start {backend}: {e:#}"))),
        };
        // Only the child holds the slave; EOF on the master follows its exit.
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().map_err(terminal_err)?;
        let writer: SharedWriter = Arc::new(Mutex::new(pair.master.take_writer().map_err(terminal_err)?));

        self.active.install(InputHandle {
            writer: writer.clone(),
            killer: child.clone_killer(),
            adapter: adapter.clone(),
            inputs: Vec::new(),
            killed: false,
        });

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("PTY read error (process likely exited): {e}");
                        break;
                    }
                }
            }
        });

        let mut captured: Vec<u8> = Vec::new();
        let mut extractor = ActivityExtractor::new();
        let mut decoder = Utf8Stream::new();
        let mut spinner = Spinner::new();
        let mut status = self
            .show_status
            .then(|| StatusLine::stderr(&backend, self.gate.clone()));
        let mut activity = String::from("starting");
        let mut exit_code: Option<i32> = None;
        let mut exited_at: Option<Instant> = None;
        let mut reader_done = false;
        let mut timed_out = false;

        loop {
            match chunk_rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    captured.extend_from_slice(&chunk);
                    self.tee(&chunk);
                    for event in extractor.feed(&decoder.decode(&chunk)) {
                        activity = event.describe();
                        self.hub.publish_activity(&activity);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => reader_done = true,
            }

            if exit_code.is_none() {
                match child.try_wait() {
                    Ok(Some(exit)) => {
                        exit_code = Some(i32::try_from(exit.exit_code()).unwrap_or(i32::MAX));
                        exited_at = Some(Instant::now());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to poll agent process");
                        exit_code = Some(-1);
                        exited_at = Some(Instant::now());
                    }
                }
            }

            if let Some(at) = exited_at {
                if reader_done || at.elapsed() >= DRAIN_GRACE {
                    break;
                }
            } else if let Some(limit) = request.timeout {
                if !timed_out && start.elapsed() >= limit {
                    warn!(backend = %backend, limit_secs = limit.as_secs(), "invocation timed out");
                    timed_out = true;
                    if let Err(e) = child.kill() {
                        debug!(error = %e, "kill after timeout failed");
                    }
                }
            }

            if let Some(line) = status.as_mut() {
                let msg = format!("{} | {}", format_elapsed(start.elapsed()), activity);
                line.update(StatusIndicator::Working(spinner.next_frame()), &msg);
            }
        }

        for event in extractor.feed(&decoder.finish()) {
            self.hub.publish_activity(&event.describe());
        }
        if let Some(event) = extractor.finish() {
            self.hub.publish_activity(&event.describe());
        }
        if let Some(line) = status.as_mut() {
            line.clear();
        }
        if let Some(log) = self.output_log.as_mut() {
            let _ = log.flush();
        }

        let handle = self.active.take();
        let (operator_inputs, killed) = handle
            .map(|h| (h.inputs, h.killed))
            .unwrap_or_default();

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            exit_code.unwrap_or(-1)
        };
        let output = String::from_utf8_lossy(&captured).to_string();
        let result_text = adapter.result_text(&output);
        let elapsed = start.elapsed();

        info!(
            backend = %backend,
            exit_code,
            timed_out,
            killed,
            elapsed_secs = elapsed.as_secs(),
            "agent process exited"
        );

        Ok(Invocation {
            backend,
            exit_code,
            output,
            result_text,
            elapsed,
            timed_out,
            killed,
            operator_inputs,
            stdin_prompt: spawn.stdin_prompt,
        })
    }
}
