//! Task store for the `prd.json` story checklist.
//!
//! The checklist is created by an external tool and edited by the agent
//! itself (it flips `passes` flags as it finishes work). The scheduler reads
//! it before and after every invocation and only writes back the free-text
//! `notes` field. Unknown fields are carried through untouched so a write
//! never drops data another tool put there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A parsed checklist file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub branch_name: String,
    /// Branch to open a pull request against once every story passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,
    /// Task-level preferred backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_threshold: Option<u32>,
    /// Effort type shown in the progress log header (feature, bugfix, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub effort_type: Option<String>,
    #[serde(default)]
    pub user_stories: Vec<Story>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One checklist item; the unit of work per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub acceptance_criteria: Vec<Criterion>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    /// Pinned backend for this story only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// An acceptance criterion. Older checklists list plain strings; those are
/// read as unsatisfied criteria and written back in the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Criterion {
    Checked {
        description: String,
        #[serde(default)]
        passes: bool,
    },
    Plain(String),
}

impl Criterion {
    pub fn description(&self) -> &str {
        match self {
            Criterion::Checked { description, .. } => description,
            Criterion::Plain(text) => text,
        }
    }

    pub fn satisfied(&self) -> bool {
        matches!(self, Criterion::Checked { passes: true, .. })
    }
}

fn default_priority() -> i64 {
    999
}

impl Story {
    /// A story claiming `passes` must have every criterion satisfied.
    /// Plain-string criteria carry no flag and are not held against it.
    pub fn criteria_consistent(&self) -> bool {
        if !self.passes {
            return true;
        }
        self.acceptance_criteria
            .iter()
            .all(|c| matches!(c, Criterion::Plain(_)) || c.satisfied())
    }
}

impl Task {
    pub fn parse(content: &str) -> Result<Self> {
        let task: Task = serde_json::from_str(content).context("failed to parse checklist JSON")?;
        let mut seen = std::collections::HashSet::new();
        for story in &task.user_stories {
            if !seen.insert(story.id.as_str()) {
                bail!("duplicate story id '{}' in checklist", story.id);
            }
        }
        Ok(task)
    }

    /// Lowest-priority unfinished story; ties keep document order.
    pub fn next_story(&self) -> Option<&Story> {
        self.user_stories
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.passes)
            .min_by_key(|(idx, s)| (s.priority, *idx))
            .map(|(_, s)| s)
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.user_stories.iter().find(|s| s.id == id)
    }

    pub fn completed_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.passes).count()
    }

    pub fn total_count(&self) -> usize {
        self.user_stories.len()
    }

    pub fn remaining_count(&self) -> usize {
        self.total_count() - self.completed_count()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_count() == 0
    }
}

/// File-backed access to a task directory's checklist.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new(task_dir: &Path) -> Self {
        Self {
            path: crate::paths::prd_file(task_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the checklist. Stories that claim `passes` with
    /// unsatisfied criteria are reported but left as the agent wrote them.
    pub fn load(&self) -> Result<Task> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read checklist: {}", self.path.display()))?;
        let task = Task::parse(&contents)
            .with_context(|| format!("failed to parse checklist: {}", self.path.display()))?;
        for story in &task.user_stories {
            if !story.criteria_consistent() {
                warn!(
                    story = %story.id,
                    "story marked passing with unsatisfied acceptance criteria"
                );
            }
        }
        Ok(task)
    }

    /// Write the checklist atomically (temp file + rename) so a concurrent
    /// reader never observes a half-written document.
    pub fn save(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_string_pretty(task).context("failed to serialize checklist")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, format!("{json}\n"))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Append a line to a story's `notes`, re-reading the file first so any
    /// edits the agent made during the invocation are kept.
    pub fn append_note(&self, story_id: &str, note: &str) -> Result<()> {
        let mut task = self.load()?;
        let Some(story) = task.user_stories.iter_mut().find(|s| s.id == story_id) else {
            warn!(story = %story_id, "story vanished from checklist; note dropped");
            return Ok(());
        };
        if !story.notes.is_empty() && !story.notes.ends_with('\n') {
            story.notes.push('\n');
        }
        story.notes.push_str(note);
        self.save(&task)
    }
}
