//! Progress log: the human-readable, append-only record of a task.
//!
//! `progress.txt` lives in the task directory next to `prd.json`. The agent
//! appends its own notes and curates a `## Codebase Patterns` section; the
//! scheduler appends iteration, failure, failover, warning, checkpoint, quit,
//! and run-summary entries. When the file grows past a line threshold it is
//! archived as `progress-N.txt` and re-seeded with the header, the patterns
//! section, and a pointer back along the archive chain.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::display::format_elapsed;
use crate::paths;

pub const PATTERNS_HEADING: &str = "## Codebase Patterns";
const TITLE: &str = "# Ralph Progress Log";
const ITERATION_MARKER: &str = " - ITERATION ";

/// Smallest usable rotation threshold. A re-seeded log without patterns is
/// 13 lines; anything at or below that would rotate every iteration.
pub const MIN_ROTATE_AT: usize = 20;

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// An entry the scheduler appends.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Iteration {
        iteration: u32,
        story: String,
        title: String,
        backend: String,
        outcome: String,
        elapsed: Duration,
    },
    Failure {
        iteration: u32,
        backend: String,
        story: String,
        failures: u32,
        error: String,
    },
    Failover {
        from: String,
        to: String,
        story: String,
        failures: u32,
        reason: String,
    },
    Warning {
        iteration: u32,
        message: String,
    },
    Checkpoint {
        iteration: u32,
        max_iterations: u32,
        completed: usize,
        total: usize,
        backend: String,
        reason: String,
    },
    Quit {
        iteration: u32,
        max_iterations: u32,
        completed: usize,
        total: usize,
        backend: String,
    },
    RunSummary {
        outcome: String,
        completed: usize,
        total: usize,
        iterations: u32,
        backend: String,
        progress_log: String,
        execution_log: String,
        output_log: String,
    },
}

impl Entry {
    pub fn render(&self, now: &str) -> String {
        match self {
            Entry::Iteration {
                iteration,
                story,
                title,
                backend,
                outcome,
                elapsed,
            } => format!(
                "\n## {now}{ITERATION_MARKER}{iteration} - {story}\n\
                 - **Title:** {title}\n\
                 - **Agent:** {backend}\n\
                 - **Result:** {outcome}\n\
                 - **Duration:** {}\n\
                 ---\n",
                format_elapsed(*elapsed)
            ),
            Entry::Failure {
                iteration,
                backend,
                story,
                failures,
                error,
            } => format!(
                "\n## {now} - FAILURE (Iteration {iteration})\n\
                 - **Agent:** {backend}\n\
                 - **Story:** {story}\n\
                 - **Consecutive failures:** {failures}\n\
                 - **Error:** {error}\n\
                 ---\n"
            ),
            Entry::Failover {
                from,
                to,
                story,
                failures,
                reason,
            } => format!(
                "\n## {now} - FAILOVER\n\
                 - **From agent:** {from}\n\
                 - **To agent:** {to}\n\
                 - **Story:** {story}\n\
                 - **Consecutive failures before failover:** {failures}\n\
                 - **Reason:** {reason}\n\
                 ---\n"
            ),
            Entry::Warning { iteration, message } => format!(
                "\n## {now} - WARNING (Iteration {iteration})\n\
                 - {message}\n\
                 ---\n"
            ),
            Entry::Checkpoint {
                iteration,
                max_iterations,
                completed,
                total,
                backend,
                reason,
            } => format!(
                "\n---\n\
                 CHECKPOINT at {now}\n\
                 Iteration: {iteration}/{max_iterations} | Stories: {completed}/{total} | Agent: {backend}\n\
                 Reason: {reason}\n\
                 ---\n"
            ),
            Entry::Quit {
                iteration,
                max_iterations,
                completed,
                total,
                backend,
            } => format!(
                "\n---\n\
                 QUIT at {now}\n\
                 Iteration: {iteration}/{max_iterations} | Stories: {completed}/{total} | Agent: {backend}\n\
                 Reason: operator quit\n\
                 ---\n"
            ),
            Entry::RunSummary {
                outcome,
                completed,
                total,
                iterations,
                backend,
                progress_log,
                execution_log,
                output_log,
            } => format!(
                "\n## {now} - RUN SUMMARY\n\
                 - **Outcome:** {outcome}\n\
                 - **Stories:** {completed}/{total}\n\
                 - **Iterations:** {iterations}\n\
                 - **Agent:** {backend}\n\
                 - **Progress log:** {progress_log}\n\
                 - **Execution log:** {execution_log}\n\
                 - **Output log:** {output_log}\n\
                 ---\n"
            ),
        }
    }
}

/// File-backed progress log for one task directory.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    task_dir: PathBuf,
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(task_dir: &Path) -> Self {
        Self {
            task_dir: task_dir.to_path_buf(),
            path: paths::progress_file(task_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with a header if it does not exist yet.
    /// Returns true when a new file was written.
    pub fn ensure_header(&self, effort: &str, effort_type: &str) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        let header = format!(
            "{TITLE}\n\
             Effort: {effort}\n\
             Type: {effort_type}\n\
             Started: {}\n\
             Rotation: 0\n\n\
             {PATTERNS_HEADING}\n\n\
             ---\n",
            now_stamp()
        );
        std::fs::write(&self.path, header)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        Ok(true)
    }

    pub fn append(&self, entry: &Entry) -> Result<()> {
        self.append_at(entry, &now_stamp())
    }

    fn append_at(&self, entry: &Entry, now: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(entry.render(now).as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Archive and re-seed the log when it has more than `threshold` lines.
    /// Returns the archive path when a rotation happened. Rotation is skipped
    /// when the re-seeded log would not be shorter than `threshold`.
    pub fn rotate_if_needed(&self, threshold: usize) -> Result<Option<PathBuf>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        if content.lines().count() <= threshold {
            return Ok(None);
        }

        let n = (1..)
            .find(|n| !self.archive_path(*n).exists())
            .unwrap_or(1);
        let field = |prefix: &str| {
            content
                .lines()
                .find(|l| l.starts_with(prefix))
                .unwrap_or(prefix)
                .to_string()
        };
        let iterations = count_iterations(&content);
        let patterns = extract_patterns_section(&content).unwrap_or(PATTERNS_HEADING);
        let prior = if n > 1 {
            format!(" (continues from progress-{}.txt)", n - 1)
        } else {
            String::new()
        };

        let reseeded = format!(
            "{TITLE}\n\
             {}\n\
             {}\n\
             {}\n\
             Rotation: {n} (rotated at {})\n\n\
             {patterns}\n\n\
             ## Prior Progress\n\
             Completed {iterations} iterations in progress-{n}.txt{prior}.\n\
             _See progress-{n}.txt for detailed iteration logs._\n\n\
             ---\n",
            field("Effort:"),
            field("Type:"),
            field("Started:"),
            now_stamp(),
        );
        let reseeded_lines = reseeded.lines().count();
        if reseeded_lines >= threshold {
            warn!(
                threshold,
                reseeded_lines,
                "progress log not rotated: header and patterns alone reach the threshold"
            );
            return Ok(None);
        }

        let archive = self.archive_path(n);
        std::fs::write(&archive, &content)
            .with_context(|| format!("failed to write {}", archive.display()))?;
        std::fs::write(&self.path, reseeded)
            .with_context(|| format!("failed to re-seed {}", self.path.display()))?;

        info!(archive = %archive.display(), iterations, "rotated progress log");
        Ok(Some(archive))
    }

    fn archive_path(&self, n: u32) -> PathBuf {
        self.task_dir.join(format!("progress-{n}.txt"))
    }
}

/// Number of ITERATION entries in a log.
pub fn count_iterations(content: &str) -> usize {
    content
        .lines()
        .filter(|l| l.starts_with("## ") && l.contains(ITERATION_MARKER))
        .count()
}

/// The `## Codebase Patterns` section, exactly as written, up to the next
/// `## ` heading. A trailing `---` rule and blank lines are dropped.
pub fn extract_patterns_section(content: &str) -> Option<&str> {
    let mut offset = 0;
    let mut start = None;
    let mut end = content.len();
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        match start {
            None if trimmed.trim() == PATTERNS_HEADING => start = Some(offset),
            Some(_) if trimmed.starts_with("## ") => {
                end = offset;
                break;
            }
            _ => {}
        }
        offset += line.len();
    }
    let section = content[start?..end].trim_end();
    Some(
        section
            .strip_suffix("---")
            .map(str::trim_end)
            .unwrap_or(section),
    )
}
