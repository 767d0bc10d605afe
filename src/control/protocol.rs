//! Wire protocol between ralph clients and a running job.
//!
//! Newline-delimited JSON over the job's Unix socket. Clients send
//! [`Request`]s; the job answers with [`ServerMessage`]s. An `attach`
//! request turns the connection into a stream of output and activity
//! messages that ends with `ended`.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Stream recent output, then live output, until the job ends.
    Attach,
    /// Stop at the next safe point.
    Checkpoint,
    /// Operator text for the agent.
    Inject { text: String },
    /// Ask the agent itself to save progress.
    ForceCheckpoint,
    /// Kill the agent and end the job.
    Quit,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output { data: String },
    Activity { text: String },
    Ack { message: String },
    Error { message: String },
    Ended { status: String },
}

impl ServerMessage {
    pub fn ack(message: impl Into<String>) -> Self {
        Self::Ack {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write + ?Sized, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let json = serde_json::to_string(message).context("failed to encode control message")?;
    writeln!(writer, "{json}").context("failed to write control message")?;
    writer.flush().context("failed to flush control message")?;
    Ok(())
}

/// Read the next message. Blank lines are skipped; `Ok(None)` at EOF.
pub fn read_message<R: BufRead + ?Sized, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .context("failed to read control message")?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid control message: {trimmed}"))?;
        return Ok(Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&Request::Inject {
            text: "look at the tests".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"inject","text":"look at the tests"}"#);
        assert_eq!(
            serde_json::to_string(&Request::ForceCheckpoint).unwrap(),
            r#"{"type":"force_checkpoint"}"#
        );
    }

    #[test]
    fn server_message_wire_format() {
        let parsed: ServerMessage = serde_json::from_str(r#"{"type":"ended","status":"completed"}"#).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Ended {
                status: "completed".into()
            }
        );
    }

    #[test]
    fn reads_lines_in_order_and_skips_blanks() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::Ping).unwrap();
        buf.extend_from_slice(b"\n");
        write_message(&mut buf, &Request::Checkpoint).unwrap();

        let mut reader = Cursor::new(buf);
        let first: Option<Request> = read_message(&mut reader).unwrap();
        let second: Option<Request> = read_message(&mut reader).unwrap();
        let third: Option<Request> = read_message(&mut reader).unwrap();
        assert_eq!(first, Some(Request::Ping));
        assert_eq!(second, Some(Request::Checkpoint));
        assert_eq!(third, None);
    }

    #[test]
    fn malformed_line_is_an_error() {
        let mut reader = Cursor::new(b"{\"type\":\"launch\"}\n".to_vec());
        let result: Result<Option<Request>> = read_message(&mut reader);
        assert!(result.is_err());
    }
}
