//! Job-side control socket.
//!
//! A listener thread accepts connections on the session's Unix socket and
//! gives each one its own handler thread. Handlers never touch the task or
//! progress files: stop requests go to the scheduler over its channel,
//! operator text goes to the agent through the active invocation slot, and
//! attached clients read from the output hub.

use std::fs;
use std::io::{BufReader, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::protocol::{Request, ServerMessage, read_message, write_message};
use crate::events::{HubMessage, OutputHub, Utf8Stream};
use crate::interactive::{self, Delivery, FORCE_CHECKPOINT_INSTRUCTION, OperatorQueue};
use crate::invoker::ActiveInvocation;
use crate::log::{ExecutionLog, LogEvent};
use crate::scheduler::ControlRequest;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Everything a connection handler may reach inside the job.
#[derive(Clone)]
pub struct JobHandle {
    pub hub: OutputHub,
    pub active: ActiveInvocation,
    pub queue: OperatorQueue,
    pub requests: Sender<ControlRequest>,
    pub execution_log: Option<Arc<ExecutionLog>>,
}

impl JobHandle {
    fn record_input(&self, kind: &str, length: usize, queued: bool) {
        if let Some(log) = &self.execution_log {
            log.record(LogEvent::OperatorInput {
                kind: kind.to_string(),
                length,
                queued,
            });
        }
    }
}

type SharedStream = Arc<Mutex<UnixStream>>;

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the socket (replacing a leftover one) and start accepting.
    pub fn start(path: &Path, job: JobHandle) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("ralph-control".into())
                .spawn(move || accept_loop(listener, job, stop))
                .context("failed to spawn control listener")?
        };

        info!(socket = %path.display(), "control socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            listener: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.take()
            && handle.join().is_err()
        {
            warn!("control listener thread panicked");
        }
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            debug!(error = %e, "failed to remove control socket");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: UnixListener, job: JobHandle, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let job = job.clone();
                let spawned = thread::Builder::new()
                    .name("ralph-control-conn".into())
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &job) {
                            debug!(error = %e, "control connection ended with error");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn control connection handler");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "control socket accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("control listener stopped");
}

fn handle_connection(stream: UnixStream, job: &JobHandle) -> Result<()> {
    stream.set_nonblocking(false)?;
    let writer: SharedStream = Arc::new(Mutex::new(
        stream.try_clone().context("failed to clone control stream")?,
    ));
    let mut reader = BufReader::new(stream);

    loop {
        let request = match read_message::<_, Request>(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>().is_some() {
                    return Err(e);
                }
                reply(&writer, &ServerMessage::error(format!("{e:#}")))?;
                continue;
            }
        };
        debug!(request = ?request, "control request");

        if request == Request::Attach {
            start_stream(job, &writer)?;
            continue;
        }
        let response = handle_request(request, job);
        reply(&writer, &response)?;
    }
}

fn handle_request(request: Request, job: &JobHandle) -> ServerMessage {
    match request {
        Request::Ping => ServerMessage::ack("pong"),
        Request::Checkpoint => {
            if job.requests.send(ControlRequest::Checkpoint).is_err() {
                return ServerMessage::error("job is shutting down");
            }
            info!("checkpoint requested over control socket");
            ServerMessage::ack("checkpoint requested; the job stops after the current iteration")
        }
        Request::Quit => {
            if job.requests.send(ControlRequest::Quit).is_err() {
                return ServerMessage::error("job is shutting down");
            }
            let killed = job.active.kill();
            info!(killed, "quit requested over control socket");
            ServerMessage::ack("quitting")
        }
        Request::Inject { text } => {
            if text.trim().is_empty() {
                return ServerMessage::error("empty message");
            }
            match interactive::deliver_message(&job.active, &job.queue, &text) {
                Ok(Delivery::Delivered) => {
                    job.record_input("message", text.len(), false);
                    ServerMessage::ack("message delivered to the agent")
                }
                Ok(Delivery::Queued) => {
                    job.record_input("message", text.len(), true);
                    ServerMessage::ack("no agent running; message queued for the next iteration")
                }
                Err(e) => ServerMessage::error(format!("delivery failed: {e:#}")),
            }
        }
        Request::ForceCheckpoint => match job.active.send_input(FORCE_CHECKPOINT_INSTRUCTION) {
            Ok(true) => {
                job.record_input("force_checkpoint", FORCE_CHECKPOINT_INSTRUCTION.len(), false);
                ServerMessage::ack("asked the agent to save progress")
            }
            Ok(false) => ServerMessage::error("no agent is running"),
            Err(e) => ServerMessage::error(format!("delivery failed: {e:#}")),
        },
        Request::Attach => ServerMessage::error("already attached"),
    }
}

/// Send the backlog, then forward hub traffic from a dedicated thread so
/// this connection can keep reading requests.
fn start_stream(job: &JobHandle, writer: &SharedStream) -> Result<()> {
    let (backlog, rx) = job.hub.subscribe();
    let mut decoder = Utf8Stream::new();
    if !backlog.is_empty() {
        reply(
            writer,
            &ServerMessage::Output {
                data: decoder.decode(&backlog),
            },
        )?;
    }
    if let Some(activity) = job.hub.latest_activity() {
        reply(writer, &ServerMessage::Activity { text: activity })?;
    }

    let writer = Arc::clone(writer);
    thread::Builder::new()
        .name("ralph-attach".into())
        .spawn(move || {
            for message in rx {
                let (message, last) = match message {
                    HubMessage::Output(data) => {
                        let data = decoder.decode(&data);
                        if data.is_empty() {
                            continue;
                        }
                        (ServerMessage::Output { data }, false)
                    }
                    HubMessage::Activity(text) => (ServerMessage::Activity { text }, false),
                    HubMessage::Ended(status) => (ServerMessage::Ended { status }, true),
                };
                if reply(&writer, &message).is_err() || last {
                    break;
                }
            }
            if let Ok(stream) = writer.lock() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        })
        .context("failed to spawn attach forwarder")?;
    Ok(())
}

fn reply(writer: &SharedStream, message: &ServerMessage) -> Result<()> {
    let mut stream = writer.lock().unwrap();
    write_message(&mut *stream, message)
}
