//! Activity extraction and live output fan-out.
//!
//! The invoker's reader thread feeds raw PTY bytes through an
//! [`ActivityExtractor`], which strips ANSI escapes, splits lines, and
//! pattern-matches them into [`ActivityEvent`]s. Claude's stream-json lines
//! are decoded for tool calls. The most recent event drives the spinner's
//! status text.
//!
//! [`OutputHub`] keeps a bounded backlog of recent output and pushes every
//! chunk and activity update to attached control clients.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Bytes of recent output replayed to a newly attached client.
pub const DEFAULT_BACKLOG_BYTES: usize = 64 * 1024;

const MAX_DESCRIBE_LEN: usize = 60;

/// Remove ANSI escape sequences from terminal output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Structured activity seen in agent output.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    /// Agent announced it is working on a story.
    StoryStarted { story: String },
    FileCreated { path: String },
    FileModified { path: String },
    CommandRan { command: String },
    TestRan { passed: bool, detail: String },
    CommitMade { hash: String, message: String },
    /// A tool call from structured (stream-json) output.
    ToolUse { tool: String, detail: String },
    /// The completion marker went by.
    CompletionSignal,
}

impl ActivityEvent {
    /// One-line description for the status line.
    pub fn describe(&self) -> String {
        let text = match self {
            ActivityEvent::StoryStarted { story } => format!("working on {story}"),
            ActivityEvent::FileCreated { path } => format!("creating {path}"),
            ActivityEvent::FileModified { path } => format!("editing {path}"),
            ActivityEvent::CommandRan { command } => format!("$ {command}"),
            ActivityEvent::TestRan { passed, .. } => {
                if *passed {
                    "tests passed".to_string()
                } else {
                    "tests failed".to_string()
                }
            }
            ActivityEvent::CommitMade { hash, .. } => {
                format!("committed {}", &hash[..7.min(hash.len())])
            }
            ActivityEvent::ToolUse { tool, detail } if detail.is_empty() => tool.clone(),
            ActivityEvent::ToolUse { tool, detail } => format!("{tool} {detail}"),
            ActivityEvent::CompletionSignal => "signalled completion".to_string(),
        };
        truncate(&text, MAX_DESCRIBE_LEN)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

type EventClassifier = fn(&regex::Captures) -> ActivityEvent;

fn cap(caps: &regex::Captures, idx: usize) -> String {
    caps.get(idx).map(|m| m.as_str().to_string()).unwrap_or_default()
}

/// Compiled regex patterns for plain-text agent output.
pub struct EventPatterns {
    patterns: Vec<(Regex, EventClassifier)>,
}

impl EventPatterns {
    /// Patterns for common agent output after ANSI stripping.
    pub fn default_patterns() -> Self {
        Self {
            patterns: vec![
                (
                    Regex::new(r"<promise>COMPLETE</promise>").unwrap(),
                    |_| ActivityEvent::CompletionSignal,
                ),
                (
                    Regex::new(r"(?i)(?:working on|starting|implementing)\s+(?:story\s+)?([A-Z]+-\d+)").unwrap(),
                    |caps| ActivityEvent::StoryStarted { story: cap(caps, 1) },
                ),
                (
                    Regex::new(r"(?:\[[\w/.-]+\s+([0-9a-f]{7,40})\]\s+(.+)|^commit\s+([0-9a-f]{7,40}))").unwrap(),
                    |caps| ActivityEvent::CommitMade {
                        hash: caps
                            .get(1)
                            .or_else(|| caps.get(3))
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                        message: cap(caps, 2),
                    },
                ),
                (
                    Regex::new(r"test result:\s*(ok|FAILED)|(\d+) (passed|failed)").unwrap(),
                    |caps| {
                        let passed = match caps.get(1) {
                            Some(m) => m.as_str() == "ok",
                            None => caps.get(3).map(|m| m.as_str()) == Some("passed"),
                        };
                        ActivityEvent::TestRan {
                            passed,
                            detail: cap(caps, 0),
                        }
                    },
                ),
                (
                    Regex::new(r"(?i)(?:created?\s+(?:file\s+)?|wrote\s+|writing\s+to\s+)([\w/.+\-]+\.\w+)").unwrap(),
                    |caps| ActivityEvent::FileCreated { path: cap(caps, 1) },
                ),
                (
                    Regex::new(r"(?i)(?:edit(?:ed|ing)?\s+|modif(?:ied|ying)\s+)([\w/.+\-]+\.\w+)").unwrap(),
                    |caps| ActivityEvent::FileModified { path: cap(caps, 1) },
                ),
                (
                    Regex::new(r"(?:^\$\s+(.+)|Running:\s+(.+))").unwrap(),
                    |caps| ActivityEvent::CommandRan {
                        command: caps
                            .get(1)
                            .or_else(|| caps.get(2))
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                    },
                ),
            ],
        }
    }

    /// Classify one ANSI-stripped line. Returns None if no pattern matches.
    pub fn classify(&self, line: &str) -> Option<ActivityEvent> {
        if line.starts_with('{') {
            if let Some(event) = classify_stream_json(line) {
                return Some(event);
            }
        }
        for (regex, classify) in &self.patterns {
            if let Some(caps) = regex.captures(line) {
                return Some(classify(&caps));
            }
        }
        None
    }
}

/// Decode a Claude stream-json line into a tool-use event.
fn classify_stream_json(line: &str) -> Option<ActivityEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type")?.as_str()? != "assistant" {
        return None;
    }
    let content = value.get("message")?.get("content")?.as_array()?;
    content.iter().rev().find_map(|block| {
        if block.get("type")?.as_str()? != "tool_use" {
            return None;
        }
        let tool = block.get("name")?.as_str()?.to_string();
        let input = block.get("input");
        let detail = ["file_path", "path", "command", "pattern", "description"]
            .iter()
            .find_map(|key| input?.get(*key)?.as_str())
            .unwrap_or_default()
            .to_string();
        Some(ActivityEvent::ToolUse { tool, detail })
    })
}

/// Incremental line splitter and classifier over raw PTY chunks.
pub struct ActivityExtractor {
    patterns: EventPatterns,
    line_buffer: String,
}

impl Default for ActivityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityExtractor {
    pub fn new() -> Self {
        Self {
            patterns: EventPatterns::default_patterns(),
            line_buffer: String::new(),
        }
    }

    /// Feed a chunk of output; returns events for every completed line.
    pub fn feed(&mut self, chunk: &str) -> Vec<ActivityEvent> {
        self.line_buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline_pos).collect();
            if let Some(event) = self.classify_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Classify whatever partial line is left once output ends.
    pub fn finish(&mut self) -> Option<ActivityEvent> {
        let rest = std::mem::take(&mut self.line_buffer);
        self.classify_line(&rest)
    }

    fn classify_line(&self, line: &str) -> Option<ActivityEvent> {
        let stripped = strip_ansi(line);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            return None;
        }
        let event = self.patterns.classify(trimmed);
        if let Some(ref event) = event {
            debug!(event = ?event, "extracted activity");
        }
        event
    }
}

/// Decodes a byte stream chunk by chunk without splitting characters.
///
/// A multi-byte UTF-8 sequence cut off at the end of a chunk is held back
/// and completed by the next one. Invalid bytes still decode lossily.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, if any.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Message pushed to hub subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Output(Vec<u8>),
    Activity(String),
    /// The job finished with this session status.
    Ended(String),
}

/// Fan-out point for live job output.
///
/// Cheap to clone; clones share the same backlog and subscriber list.
#[derive(Debug, Clone)]
pub struct OutputHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Debug)]
struct HubInner {
    backlog: VecDeque<u8>,
    max_backlog: usize,
    subscribers: Vec<Sender<HubMessage>>,
    latest_activity: Option<String>,
}

impl Default for OutputHub {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_BYTES)
    }
}

impl OutputHub {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                backlog: VecDeque::with_capacity(max_backlog.min(DEFAULT_BACKLOG_BYTES)),
                max_backlog,
                subscribers: Vec::new(),
                latest_activity: None,
            })),
        }
    }

    /// Register a subscriber. Returns the current backlog and the receiver
    /// for everything published afterwards, atomically with respect to
    /// publishers.
    pub fn subscribe(&self) -> (Vec<u8>, Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap();
        let backlog = inner.backlog.iter().copied().collect();
        inner.subscribers.push(tx);
        (backlog, rx)
    }

    pub fn publish_output(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.backlog.extend(data.iter().copied());
        let overflow = inner.backlog.len().saturating_sub(inner.max_backlog);
        inner.backlog.drain(..overflow);
        inner.broadcast(HubMessage::Output(data.to_vec()));
    }

    pub fn publish_activity(&self, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.latest_activity = Some(text.to_string());
        inner.broadcast(HubMessage::Activity(text.to_string()));
    }

    /// Tell every subscriber the job is over and drop them.
    pub fn close(&self, status: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.broadcast(HubMessage::Ended(status.to_string()));
        inner.subscribers.clear();
    }

    pub fn latest_activity(&self) -> Option<String> {
        self.inner.lock().unwrap().latest_activity.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl HubInner {
    /// Send to every subscriber, dropping those whose receiver is gone.
    fn broadcast(&mut self, msg: HubMessage) {
        self.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }
}
