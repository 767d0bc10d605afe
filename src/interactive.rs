//! Operator interaction with a running job.
//!
//! The job side delivers operator text to the agent in flight (or queues it
//! for the next prompt when nothing is running) and scrubs the terminal echo
//! of that text before the output is classified. The client side is the
//! `attach --interactive` front-end: one-letter commands, a multi-line
//! composer, and a display gate that holds agent output while the operator
//! types.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::control::protocol::{Request, ServerMessage};
use crate::control::ControlClient;
use crate::display::{DisplayGate, StatusIndicator, StatusLine};
use crate::invoker::ActiveInvocation;

/// Typed into the agent when the operator forces a checkpoint.
pub const FORCE_CHECKPOINT_INSTRUCTION: &str = "Please save your progress now. \
Record what you finished and what remains in the progress file, commit your work, \
and end this session cleanly.";

const CANCEL_COMMAND: &str = ":cancel";
const ESC: &str = "\x1b";

const HELP: &str = "\
commands:
  m   compose a message to the agent (two blank lines send, ESC or :cancel aborts)
  c   ask the agent to save progress now
  q   quit: stop the agent and end the job
  h   show this help";

/// Messages typed while no invocation was running.
#[derive(Debug, Clone, Default)]
pub struct OperatorQueue {
    inner: Arc<Mutex<Vec<String>>>,
}

impl OperatorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: &str) {
        self.inner.lock().unwrap().push(text.to_string());
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the running agent's terminal.
    Delivered,
    /// No agent running; prepended to the next prompt.
    Queued,
}

/// Send operator text to the running agent, or queue it.
pub fn deliver_message(active: &ActiveInvocation, queue: &OperatorQueue, text: &str) -> Result<Delivery> {
    if active.send_input(text)? {
        info!(length = text.len(), "operator message delivered to agent");
        return Ok(Delivery::Delivered);
    }
    queue.push(text);
    info!(length = text.len(), queued = queue.len(), "no agent running, message queued");
    Ok(Delivery::Queued)
}

/// Remove the terminal's echo of typed input from captured output.
///
/// Each non-blank input line removes the first output line equal to it,
/// searching forward from the previous match so echoes are consumed in the
/// order they were typed. Lines the agent merely quotes later are kept.
pub fn strip_operator_echo(output: &str, inputs: &[String]) -> String {
    let normalized = output.replace("\r\n", "\n");
    let mut lines: Vec<Option<&str>> = normalized.split('\n').map(Some).collect();
    let mut cursor = 0;

    for input in inputs {
        let input = input.replace("\r\n", "\n");
        for wanted in input.split('\n').map(str::trim_end) {
            if wanted.trim().is_empty() {
                continue;
            }
            let found = (cursor..lines.len())
                .find(|&i| lines[i].is_some_and(|line| line.trim_end_matches('\r').trim_end() == wanted));
            if let Some(i) = found {
                lines[i] = None;
                cursor = i + 1;
            }
        }
    }

    lines.into_iter().flatten().collect::<Vec<_>>().join("\n")
}

/// One-line operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Message,
    Checkpoint,
    Quit,
    Help,
}

pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "m" | "msg" | "message" => Some(OperatorCommand::Message),
        "c" | "checkpoint" => Some(OperatorCommand::Checkpoint),
        "q" | "quit" => Some(OperatorCommand::Quit),
        "h" | "help" | "?" => Some(OperatorCommand::Help),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeStep {
    Continue,
    Send(String),
    Cancel,
}

/// Multi-line message editor state.
#[derive(Debug, Default)]
pub struct Composer {
    lines: Vec<String>,
    trailing_blank: usize,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> ComposeStep {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim() == CANCEL_COMMAND || line.starts_with(ESC) {
            return ComposeStep::Cancel;
        }
        if line.trim().is_empty() {
            self.trailing_blank += 1;
            if self.trailing_blank >= 2 {
                let text = self.text();
                return if text.is_empty() {
                    ComposeStep::Cancel
                } else {
                    ComposeStep::Send(text)
                };
            }
        } else {
            self.trailing_blank = 0;
        }
        self.lines.push(line.to_string());
        ComposeStep::Continue
    }

    fn text(&self) -> String {
        let end = self
            .lines
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(0, |i| i + 1);
        let start = self
            .lines
            .iter()
            .position(|l| !l.trim().is_empty())
            .unwrap_or(end);
        self.lines[start..end].join("\n")
    }
}

/// `ralph attach --interactive`: stream the job's output and accept
/// operator commands from stdin until the job ends or the operator quits.
pub fn run_front_end(client: ControlClient, label: &str) -> Result<()> {
    let gate = DisplayGate::new();
    let ended = Arc::new(AtomicBool::new(false));
    let writer = client.try_clone().context("failed to clone control connection")?;
    let writer = Arc::new(Mutex::new(writer));

    let forwarder = {
        let gate = gate.clone();
        let ended = Arc::clone(&ended);
        let label = label.to_string();
        thread::spawn(move || forward_server_messages(client, gate, ended, &label))
    };

    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    eprintln!("{HELP}");
    let mut composer: Option<Composer> = None;
    loop {
        if ended.load(Ordering::SeqCst) {
            break;
        }
        let line = match line_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Some(editor) = composer.as_mut() {
            match editor.push_line(&line) {
                ComposeStep::Continue => {}
                ComposeStep::Send(text) => {
                    composer = None;
                    send(&writer, &Request::Inject { text })?;
                    gate.resume(&mut io::stdout())?;
                }
                ComposeStep::Cancel => {
                    composer = None;
                    eprintln!("[ralph] message discarded");
                    gate.resume(&mut io::stdout())?;
                }
            }
            continue;
        }

        match parse_command(&line) {
            Some(OperatorCommand::Message) => {
                gate.suspend();
                eprintln!("\r\x1b[2K[ralph] compose message (two blank lines send, :cancel aborts):");
                composer = Some(Composer::new());
            }
            Some(OperatorCommand::Checkpoint) => send(&writer, &Request::ForceCheckpoint)?,
            Some(OperatorCommand::Quit) => {
                send(&writer, &Request::Quit)?;
                break;
            }
            Some(OperatorCommand::Help) => eprintln!("{HELP}"),
            None if line.trim().is_empty() => {}
            None => eprintln!("[ralph] unknown command '{}' (h for help)", line.trim()),
        }
    }

    if gate.is_suspended() {
        gate.resume(&mut io::stdout())?;
    }
    // Quit leaves the forwarder running until the job reports its end.
    if forwarder.join().is_err() {
        debug!("output forwarder panicked");
    }
    Ok(())
}

fn send(writer: &Arc<Mutex<ControlClient>>, request: &Request) -> Result<()> {
    writer.lock().unwrap().send(request)
}

fn forward_server_messages(mut client: ControlClient, gate: DisplayGate, ended: Arc<AtomicBool>, label: &str) {
    let mut status = StatusLine::stderr(label, gate.clone());
    let mut stdout = io::stdout();
    loop {
        let message = match client.next_message() {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "control connection closed");
                break;
            }
        };
        match message {
            ServerMessage::Output { data } => {
                status.clear();
                if let Err(e) = gate.write_output(&mut stdout, data.as_bytes()) {
                    debug!(error = %e, "stdout write failed");
                }
            }
            ServerMessage::Activity { text } => status.update(StatusIndicator::StateChange, &text),
            ServerMessage::Ack { message } => status.force_update(StatusIndicator::Action, &message),
            ServerMessage::Error { message } => status.force_update(StatusIndicator::Failure, &message),
            ServerMessage::Ended { status: end } => {
                status.clear();
                let _ = gate.resume(&mut stdout);
                eprintln!("[ralph] job ended: {end}");
                break;
            }
        }
    }
    ended.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_echoed_prompt_lines() {
        let prompt = "# Instructions\nDo the work.\nSay <promise>COMPLETE</promise> when done.\n".to_string();
        let output = "# Instructions\r\nDo the work.\r\nSay <promise>COMPLETE</promise> when done.\r\n^D\r\nworking on US-001\r\n";
        let cleaned = strip_operator_echo(output, &[prompt]);
        assert!(!cleaned.contains("<promise>COMPLETE</promise>"));
        assert!(cleaned.contains("working on US-001"));
    }

    #[test]
    fn keeps_agent_repetition_after_echo() {
        let inputs = vec!["use the cache".to_string()];
        let output = "use the cache\nok, I will use the cache\nuse the cache\n";
        let cleaned = strip_operator_echo(output, &inputs);
        assert_eq!(cleaned, "ok, I will use the cache\nuse the cache\n");
    }

    #[test]
    fn echo_search_moves_forward() {
        let inputs = vec!["first".to_string(), "second".to_string()];
        let output = "second\nfirst\nagent\nsecond\n";
        let cleaned = strip_operator_echo(output, &inputs);
        assert_eq!(cleaned, "second\nagent\n");
    }

    #[test]
    fn no_inputs_leaves_output_alone() {
        assert_eq!(strip_operator_echo("a\nb", &[]), "a\nb");
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("m"), Some(OperatorCommand::Message));
        assert_eq!(parse_command(" C "), Some(OperatorCommand::Checkpoint));
        assert_eq!(parse_command("quit"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("?"), Some(OperatorCommand::Help));
        assert_eq!(parse_command("x"), None);
    }

    #[test]
    fn composer_sends_on_two_blank_lines() {
        let mut c = Composer::new();
        assert_eq!(c.push_line("Please look at"), ComposeStep::Continue);
        assert_eq!(c.push_line(""), ComposeStep::Continue);
        assert_eq!(c.push_line("src/lib.rs first"), ComposeStep::Continue);
        assert_eq!(c.push_line(""), ComposeStep::Continue);
        assert_eq!(
            c.push_line(""),
            ComposeStep::Send("Please look at\n\nsrc/lib.rs first".to_string())
        );
    }

    #[test]
    fn composer_cancels() {
        let mut c = Composer::new();
        c.push_line("draft");
        assert_eq!(c.push_line(":cancel"), ComposeStep::Cancel);

        let mut c = Composer::new();
        c.push_line("draft");
        assert_eq!(c.push_line("\x1b"), ComposeStep::Cancel);

        let mut c = Composer::new();
        c.push_line("");
        assert_eq!(c.push_line(""), ComposeStep::Cancel);
    }

    #[test]
    fn idle_message_is_queued() {
        let active = ActiveInvocation::new();
        let queue = OperatorQueue::new();
        let delivery = deliver_message(&active, &queue, "focus on tests").unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(queue.drain(), vec!["focus on tests".to_string()]);
        assert!(queue.is_empty());
    }
}
