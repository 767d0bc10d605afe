//! Control surface: find a session and talk to its job.
//!
//! `status`, `attach`, `checkpoint` and `stop` all start from the session
//! registry. Only `attach` and `checkpoint` need the job's socket; `stop`
//! works on the pid alone so it also handles a wedged job.

pub mod protocol;
pub mod server;

use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};

use crate::paths;
use crate::process::{self, Termination};
use crate::registry::{ListFilter, Registry, RegistryError, Session, SessionStatus};
use protocol::{Request, ServerMessage, read_message, write_message};

/// Connect and reply timeout for one-shot requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no running ralph session")]
    NoRunningSession,

    #[error("several sessions are running, name one of: {}", .0.join(", "))]
    Ambiguous(Vec<String>),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{name}' is not running (status: {status})")]
    NotRunning { name: String, status: SessionStatus },

    #[error("session '{name}' is not reachable at {}: {source}", .socket.display())]
    Unreachable {
        name: String,
        socket: PathBuf,
        source: std::io::Error,
    },

    #[error("job refused the request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Resolve a user-supplied session target.
///
/// A target containing a path separator (or naming an existing directory)
/// is mapped to its session name. Without a target, the single running
/// session is used.
pub fn resolve_session(registry: &Registry, target: Option<&str>) -> Result<Session, ControlError> {
    match target {
        Some(target) => {
            let name = session_name_for_target(target);
            registry
                .get(&name)?
                .ok_or(ControlError::NotFound(name))
        }
        None => {
            let mut running = registry.list(ListFilter::Running)?;
            match running.len() {
                0 => Err(ControlError::NoRunningSession),
                1 => Ok(running.remove(0)),
                _ => Err(ControlError::Ambiguous(
                    running.into_iter().map(|s| s.name).collect(),
                )),
            }
        }
    }
}

fn session_name_for_target(target: &str) -> String {
    let path = Path::new(target);
    if target.contains('/') || path.is_dir() {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        paths::session_name(&resolved)
    } else {
        target.to_string()
    }
}

fn require_running(session: Session) -> Result<Session, ControlError> {
    if session.status == SessionStatus::Running {
        Ok(session)
    } else {
        Err(ControlError::NotRunning {
            name: session.name,
            status: session.status,
        })
    }
}

/// One connection to a job's control socket.
pub struct ControlClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl ControlClient {
    pub fn connect(socket: &Path, timeout: Duration) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
        })
    }

    /// Connect to a session's job, mapping failures to
    /// [`ControlError::Unreachable`].
    pub fn for_session(data_dir: &Path, session: &Session, timeout: Duration) -> Result<Self, ControlError> {
        let socket = paths::control_socket(data_dir, &session.name);
        Self::connect(&socket, timeout).map_err(|source| ControlError::Unreachable {
            name: session.name.clone(),
            socket,
            source,
        })
    }

    /// Drop the read timeout (attached clients wait on output indefinitely).
    pub fn without_read_timeout(self) -> std::io::Result<Self> {
        self.writer.set_read_timeout(None)?;
        Ok(self)
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        let writer = self.writer.try_clone()?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { writer, reader })
    }

    pub fn send(&mut self, request: &Request) -> Result<()> {
        write_message(&mut self.writer, request)
    }

    #[cfg(test)]
    pub(crate) fn send_raw(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        read_message(&mut self.reader)
    }

    /// Send a request and wait for its single reply.
    pub fn request(&mut self, request: &Request) -> Result<ServerMessage> {
        self.send(request)?;
        self.next_message()?
            .context("job closed the connection without replying")
    }
}

/// Render `ralph status`.
pub fn status(data_dir: &Path, json: bool) -> Result<String> {
    let registry = Registry::open(&paths::registry_db(data_dir))?;
    let sessions = registry.list(ListFilter::All)?;
    if json {
        return serde_json::to_string_pretty(&sessions).context("failed to encode sessions");
    }
    Ok(render_status_table(&sessions))
}

pub fn render_status_table(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "no ralph sessions".to_string();
    }
    let mut out = format!(
        "{:<24} {:<10} {:<10} {:<7} {:<8} {}\n",
        "SESSION", "STATUS", "BACKEND", "STORIES", "ITER", "STORY"
    );
    for s in sessions {
        out.push_str(&format!(
            "{:<24} {:<10} {:<10} {:<7} {:<8} {}\n",
            s.name,
            s.status,
            s.backend,
            s.stories_label(),
            s.iterations_label(),
            s.current_story.as_deref().unwrap_or("-"),
        ));
    }
    out.truncate(out.trim_end().len());
    out
}

/// `ralph checkpoint`: ask the job to stop at its next safe point.
pub fn checkpoint(data_dir: &Path, target: Option<&str>) -> Result<String> {
    let registry = Registry::open(&paths::registry_db(data_dir))?;
    let session = require_running(resolve_session(&registry, target)?)?;

    let mut client = ControlClient::for_session(data_dir, &session, REQUEST_TIMEOUT)?;
    match client.request(&Request::Checkpoint)? {
        ServerMessage::Ack { message } => {
            info!(session = %session.name, "checkpoint requested");
            Ok(format!("{}: {message}", session.name))
        }
        ServerMessage::Error { message } => Err(ControlError::Rejected(message).into()),
        other => Err(ControlError::Rejected(format!("unexpected reply: {other:?}")).into()),
    }
}

/// `ralph stop`: terminate the job process and mark the row stopped.
pub fn stop(data_dir: &Path, target: Option<&str>) -> Result<String> {
    let registry = Registry::open(&paths::registry_db(data_dir))?;
    let session = require_running(resolve_session(&registry, target)?)?;

    let outcome = process::terminate(session.pid, process::STOP_GRACE)?;
    debug!(session = %session.name, pid = session.pid, outcome = ?outcome, "stop signalled");
    registry.mark_stopped(&session.name)?;

    Ok(match outcome {
        Termination::Killed => format!("{}: stopped (pid {} killed)", session.name, session.pid),
        _ => format!("{}: stopped", session.name),
    })
}

/// `ralph attach`: stream the job's output, read-only unless interactive.
pub fn attach(data_dir: &Path, target: Option<&str>, interactive: bool) -> Result<()> {
    let registry = Registry::open(&paths::registry_db(data_dir))?;
    let session = require_running(resolve_session(&registry, target)?)?;
    drop(registry);

    let mut client = ControlClient::for_session(data_dir, &session, REQUEST_TIMEOUT)?;
    client.send(&Request::Attach)?;
    let client = client
        .without_read_timeout()
        .context("failed to configure control connection")?;

    eprintln!("[ralph] attached to {} (pid {})", session.name, session.pid);
    if interactive {
        return crate::interactive::run_front_end(client, &session.name);
    }
    follow_output(client)
}

fn follow_output(mut client: ControlClient) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(message) = client.next_message()? {
        match message {
            ServerMessage::Output { data } => {
                stdout.write_all(data.as_bytes())?;
                stdout.flush()?;
            }
            ServerMessage::Activity { text } => debug!(activity = %text, "agent activity"),
            ServerMessage::Ack { message } => debug!(%message, "ack"),
            ServerMessage::Error { message } => eprintln!("[ralph] {message}"),
            ServerMessage::Ended { status } => {
                eprintln!("[ralph] job ended: {status}");
                break;
            }
        }
    }
    Ok(())
}
