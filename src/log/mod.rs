//! Structured execution log: one JSON line per event of a run.
//!
//! Every ralph job writes a `.jsonl` log capturing session lifecycle,
//! iterations, invocation outcomes, failovers, operator input, and the final
//! result. Each line is a self-contained JSON object with an RFC 3339
//! timestamp. The log is a product artifact and is written regardless of the
//! tracing level.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        session: String,
        task_dir: String,
        backend: String,
        max_iterations: u32,
        failover_threshold: u32,
    },
    IterationStarted {
        iteration: u32,
        story: String,
        backend: String,
        model: Option<String>,
        pinned: bool,
    },
    InvocationFinished {
        iteration: u32,
        backend: String,
        exit_code: i32,
        classification: String,
        elapsed_secs: u64,
        timed_out: bool,
        output_bytes: usize,
        error: Option<String>,
    },
    Failover {
        from: String,
        to: String,
        failures: u32,
        reason: String,
    },
    /// Operator text delivered to (or queued for) the agent.
    OperatorInput {
        kind: String,
        length: usize,
        queued: bool,
    },
    Checkpoint {
        iteration: u32,
        reason: String,
    },
    RunCompleted {
        iterations: u32,
        completed: usize,
        total: usize,
    },
    RunFailed {
        outcome: String,
        reason: String,
        iterations: u32,
    },
    SessionEnded {
        status: String,
        exit_code: i32,
    },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Log an event; a write failure is reported but never stops the run.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(error = %e, path = %self.path.display(), "execution log write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-10-17T09:00:00Z".to_string(),
            event: LogEvent::Failover {
                from: "claude".to_string(),
                to: "opencode".to_string(),
                failures: 3,
                reason: "rate limit".to_string(),
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"failover\""));
        assert!(json.contains("\"to\":\"opencode\""));
        assert!(json.contains("\"timestamp\":\"2026-10-17T09:00:00Z\""));
    }

    #[test]
    fn all_event_types_serialize() {
        let events = vec![
            LogEvent::SessionStarted {
                session: "auth".into(),
                task_dir: "tasks/auth".into(),
                backend: "claude".into(),
                max_iterations: 10,
                failover_threshold: 3,
            },
            LogEvent::IterationStarted {
                iteration: 1,
                story: "US-001".into(),
                backend: "claude".into(),
                model: None,
                pinned: false,
            },
            LogEvent::InvocationFinished {
                iteration: 1,
                backend: "claude".into(),
                exit_code: 0,
                classification: "success".into(),
                elapsed_secs: 12,
                timed_out: false,
                output_bytes: 2048,
                error: None,
            },
            LogEvent::OperatorInput {
                kind: "message".into(),
                length: 14,
                queued: false,
            },
            LogEvent::Checkpoint {
                iteration: 2,
                reason: "operator request".into(),
            },
            LogEvent::RunCompleted {
                iterations: 3,
                completed: 2,
                total: 2,
            },
            LogEvent::RunFailed {
                outcome: "exhausted".into(),
                reason: "all backends failed".into(),
                iterations: 6,
            },
            LogEvent::SessionEnded {
                status: "completed".into(),
                exit_code: 0,
            },
        ];
        for event in events {
            let entry = LogEntry {
                timestamp: now_rfc3339(),
                event,
            };
            let json = serde_json::to_string(&entry).unwrap();
            assert!(json.contains("\"event\":"), "{json}");
            assert!(json.contains("\"data\":"), "{json}");
        }
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("execution.jsonl");
        let log = ExecutionLog::new(&path).unwrap();
        log.log(LogEvent::Checkpoint {
            iteration: 4,
            reason: "operator request".into(),
        })
        .unwrap();
        log.record(LogEvent::SessionEnded {
            status: "stopped".into(),
            exit_code: 0,
        });

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "checkpoint");
        assert_eq!(lines[0]["data"]["iteration"], 4);
        assert_eq!(lines[1]["data"]["status"], "stopped");
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions").join("auth").join("execution.jsonl");
        let log = ExecutionLog::new(&path).unwrap();
        assert!(path.exists());
        assert_eq!(log.path(), path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("execution.jsonl");
        for status in ["stopped", "completed"] {
            let log = ExecutionLog::new(&path).unwrap();
            log.record(LogEvent::SessionEnded {
                status: status.into(),
                exit_code: 0,
            });
        }
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["data"]["status"], "completed");
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok(), "{ts}");
        assert!(ts.ends_with('Z'));
    }
}
