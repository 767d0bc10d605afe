//! Terminal liveness display: spinner frames, a debounced status line, and a
//! gate that holds output while the operator is typing.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Status line state indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusIndicator {
    /// `●` State change (iteration start, backend switch).
    StateChange,
    /// `→` Operator action delivered.
    Action,
    /// `✓` Iteration succeeded / run completed.
    Ok,
    /// Agent working; shows the current spinner frame.
    Working(&'static str),
    /// `⚠` Waiting on the operator.
    NeedsInput,
    /// `✗` Failure.
    Failure,
}

impl StatusIndicator {
    fn symbol(&self) -> &'static str {
        match self {
            Self::StateChange => "●",
            Self::Action => "→",
            Self::Ok => "✓",
            Self::Working(frame) => *frame,
            Self::NeedsInput => "⚠",
            Self::Failure => "✗",
        }
    }
}

#[derive(Debug, Default)]
pub struct Spinner {
    frame: usize,
}

impl Spinner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_frame(&mut self) -> &'static str {
        let frame = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame = self.frame.wrapping_add(1);
        frame
    }
}

/// Render a duration as `42s`, `3m07s` or `1h02m`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Holds output back while the operator is composing.
///
/// Only display is paused; the agent keeps running and its output is
/// replayed in order on [`DisplayGate::resume`].
#[derive(Debug, Clone, Default)]
pub struct DisplayGate {
    inner: Arc<Mutex<GateInner>>,
}

#[derive(Debug, Default)]
struct GateInner {
    suspended: bool,
    held: Vec<u8>,
}

impl DisplayGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().unwrap().suspended
    }

    pub fn suspend(&self) {
        self.inner.lock().unwrap().suspended = true;
    }

    /// Write `data` now, or hold it if suspended.
    pub fn write_output(&self, out: &mut dyn Write, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.suspended {
            inner.held.extend_from_slice(data);
            return Ok(());
        }
        out.write_all(data)?;
        out.flush()
    }

    /// Lift the suspension and flush everything held meanwhile.
    pub fn resume(&self, out: &mut dyn Write) -> io::Result<()> {
        let held = {
            let mut inner = self.inner.lock().unwrap();
            inner.suspended = false;
            std::mem::take(&mut inner.held)
        };
        if !held.is_empty() {
            out.write_all(&held)?;
        }
        out.flush()
    }
}

/// Single-line status display, redrawn in place.
///
/// Format: `[ralph] <label> | <indicator> <message>`
///
/// Debounces updates to max ~5/sec and stays quiet while the gate is
/// suspended.
pub struct StatusLine {
    label: String,
    sink: Box<dyn Write + Send>,
    gate: DisplayGate,
    last_update: Option<Instant>,
    min_interval: Duration,
}

impl StatusLine {
    pub fn new(label: &str, sink: Box<dyn Write + Send>, gate: DisplayGate) -> Self {
        Self {
            label: label.to_string(),
            sink,
            gate,
            last_update: None,
            min_interval: Duration::from_millis(200),
        }
    }

    /// Status line on stderr.
    pub fn stderr(label: &str, gate: DisplayGate) -> Self {
        Self::new(label, Box::new(io::stderr()), gate)
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    /// Debounced: skips the update if called too frequently.
    pub fn update(&mut self, indicator: StatusIndicator, message: &str) {
        self.update_inner(indicator, message, false);
    }

    /// Bypasses debounce.
    pub fn force_update(&mut self, indicator: StatusIndicator, message: &str) {
        self.update_inner(indicator, message, true);
    }

    /// Erase the line so regular output can follow.
    pub fn clear(&mut self) {
        if self.gate.is_suspended() {
            return;
        }
        if let Err(e) = write!(self.sink, "\r\x1b[2K").and_then(|_| self.sink.flush()) {
            debug!(error = %e, "status line clear failed");
        }
    }

    fn update_inner(&mut self, indicator: StatusIndicator, message: &str, force: bool) {
        if self.gate.is_suspended() {
            return;
        }
        if !force
            && self
                .last_update
                .is_some_and(|last| last.elapsed() < self.min_interval)
        {
            return;
        }

        let line = format!(
            "\r\x1b[2K[ralph] {} | {} {}",
            self.label,
            indicator.symbol(),
            message
        );
        // Best-effort; a broken terminal must not stop the run.
        if let Err(e) = self.sink.write_all(line.as_bytes()).and_then(|_| self.sink.flush()) {
            debug!(error = %e, "status line update failed");
        }
        self.last_update = Some(Instant::now());
    }
}
