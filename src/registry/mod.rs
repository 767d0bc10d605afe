//! Session registry: one SQLite row per job, shared by every ralph process.
//!
//! Each job owns its row and is the only writer of it while running. Other
//! processes (`status`, `attach`, `stop`) open their own connections and only
//! read, except for two cases: `stop` marks the row `stopped`, and any reader
//! that finds a `running` row whose pid is gone flips it to `dead`. Terminal
//! status is written at most once; every terminal update is guarded by
//! `WHERE status = 'running'`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::log::now_rfc3339;
use crate::process;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("registry i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt registry row for '{name}': {reason}")]
    Corrupt { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Completed,
    Failed,
    Dead,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// A registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub name: String,
    pub task_dir: String,
    pub pid: u32,
    pub backend: String,
    pub started_at: String,
    pub updated_at: String,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub current_story: Option<String>,
    pub completed_stories: u32,
    pub total_stories: u32,
    pub status: SessionStatus,
}

impl Session {
    /// `done/total`
    pub fn stories_label(&self) -> String {
        format!("{}/{}", self.completed_stories, self.total_stories)
    }

    /// `iter/max`
    pub fn iterations_label(&self) -> String {
        format!("{}/{}", self.current_iteration, self.max_iterations)
    }
}

/// Fields supplied when a job registers.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: String,
    pub task_dir: String,
    pub pid: u32,
    pub backend: String,
    pub max_iterations: u32,
    pub completed_stories: u32,
    pub total_stories: u32,
}

/// Per-iteration progress written by the owning job.
#[derive(Debug, Clone)]
pub struct ProgressUpdate<'a> {
    pub iteration: u32,
    pub story: Option<&'a str>,
    pub backend: &'a str,
    pub completed_stories: u32,
    pub total_stories: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    #[default]
    All,
    Running,
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let registry = Self { conn };
        registry.init_schema()?;
        debug!(path = %path.display(), "opened session registry");
        Ok(registry)
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS sessions (
                name              TEXT PRIMARY KEY,
                task_dir          TEXT NOT NULL,
                pid               INTEGER NOT NULL,
                backend           TEXT NOT NULL,
                started_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                max_iterations    INTEGER NOT NULL,
                current_iteration INTEGER NOT NULL DEFAULT 0,
                current_story     TEXT,
                completed_stories INTEGER NOT NULL DEFAULT 0,
                total_stories     INTEGER NOT NULL DEFAULT 0,
                status            TEXT NOT NULL DEFAULT 'running'
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            ",
        )?;
        Ok(())
    }

    /// Claim the row for a new job.
    ///
    /// Fails with [`RegistryError::AlreadyRunning`] when a running row with a
    /// live pid holds the name. Finished or stale rows are replaced.
    pub fn register(&mut self, new: &NewSession) -> Result<Session, RegistryError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT * FROM sessions WHERE name = ?1",
                params![new.name],
                row_to_session,
            )
            .optional()?
            .transpose()?;

        if let Some(existing) = existing {
            if existing.status == SessionStatus::Running && process::is_alive(existing.pid) {
                return Err(RegistryError::AlreadyRunning {
                    name: existing.name,
                    pid: existing.pid,
                });
            }
            debug!(
                session = %existing.name,
                status = %existing.status,
                "replacing previous registry row"
            );
        }

        let now = now_rfc3339();
        tx.execute(
            "INSERT OR REPLACE INTO sessions (
                name, task_dir, pid, backend, started_at, updated_at, max_iterations,
                current_iteration, current_story, completed_stories, total_stories, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 0, NULL, ?7, ?8, 'running')",
            params![
                new.name,
                new.task_dir,
                i64::from(new.pid),
                new.backend,
                now,
                i64::from(new.max_iterations),
                i64::from(new.completed_stories),
                i64::from(new.total_stories),
            ],
        )?;
        tx.commit()?;

        info!(session = %new.name, pid = new.pid, "registered session");
        Ok(Session {
            name: new.name.clone(),
            task_dir: new.task_dir.clone(),
            pid: new.pid,
            backend: new.backend.clone(),
            started_at: now.clone(),
            updated_at: now,
            max_iterations: new.max_iterations,
            current_iteration: 0,
            current_story: None,
            completed_stories: new.completed_stories,
            total_stories: new.total_stories,
            status: SessionStatus::Running,
        })
    }

    pub fn update_progress(&self, name: &str, update: &ProgressUpdate<'_>) -> Result<(), RegistryError> {
        self.conn.execute(
            "UPDATE sessions
             SET current_iteration = ?2, current_story = ?3, backend = ?4,
                 completed_stories = ?5, total_stories = ?6, updated_at = ?7
             WHERE name = ?1 AND status = 'running'",
            params![
                name,
                i64::from(update.iteration),
                update.story,
                update.backend,
                i64::from(update.completed_stories),
                i64::from(update.total_stories),
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Write the terminal status. Returns `false` if the row had already left
    /// `running` (someone else finished it first).
    pub fn finish(&self, name: &str, status: SessionStatus) -> Result<bool, RegistryError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3
             WHERE name = ?1 AND status = 'running'",
            params![name, status.as_str(), now_rfc3339()],
        )?;
        if changed > 0 {
            info!(session = name, status = %status, "session finished");
        }
        Ok(changed > 0)
    }

    /// Used by `ralph stop`: the row becomes `stopped` without waiting for
    /// the job to reach a safe point.
    pub fn mark_stopped(&self, name: &str) -> Result<bool, RegistryError> {
        self.finish(name, SessionStatus::Stopped)
    }

    /// Fetch one row, reconciling a dead `running` row first.
    pub fn get(&self, name: &str) -> Result<Option<Session>, RegistryError> {
        let row = self
            .conn
            .query_row(
                "SELECT * FROM sessions WHERE name = ?1",
                params![name],
                row_to_session,
            )
            .optional()?
            .transpose()?;
        match row {
            Some(session) => Ok(Some(self.reconcile(session)?)),
            None => Ok(None),
        }
    }

    /// All rows (or just the running ones), ordered by name.
    pub fn list(&self, filter: ListFilter) -> Result<Vec<Session>, RegistryError> {
        let mut stmt = self.conn.prepare("SELECT * FROM sessions ORDER BY name")?;
        let rows = stmt
            .query_map([], row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let session = self.reconcile(row?)?;
            if filter == ListFilter::Running && session.status != SessionStatus::Running {
                continue;
            }
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// The only place staleness is resolved: a `running` row whose pid no
    /// longer exists becomes `dead`.
    fn reconcile(&self, mut session: Session) -> Result<Session, RegistryError> {
        if session.status != SessionStatus::Running || process::is_alive(session.pid) {
            return Ok(session);
        }
        let now = now_rfc3339();
        let changed = self.conn.execute(
            "UPDATE sessions SET status = 'dead', updated_at = ?3
             WHERE name = ?1 AND pid = ?2 AND status = 'running'",
            params![session.name, i64::from(session.pid), now],
        )?;
        if changed > 0 {
            info!(session = %session.name, pid = session.pid, "job process is gone, marked dead");
            session.status = SessionStatus::Dead;
            session.updated_at = now;
        } else if let Some(current) = self.reread(&session.name)? {
            session = current;
        }
        Ok(session)
    }

    fn reread(&self, name: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM sessions WHERE name = ?1",
                params![name],
                row_to_session,
            )
            .optional()?
            .transpose()?)
    }
}

fn column_u32(row: &Row<'_>, column: &str) -> rusqlite::Result<u32> {
    let value: i64 = row.get(column)?;
    Ok(u32::try_from(value).unwrap_or(0))
}

/// Map a row; a bad status string surfaces as [`RegistryError::Corrupt`].
fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Result<Session, RegistryError>> {
    let name: String = row.get("name")?;
    let status_raw: String = row.get("status")?;
    let status = match status_raw.parse::<SessionStatus>() {
        Ok(status) => status,
        Err(reason) => return Ok(Err(RegistryError::Corrupt { name, reason })),
    };
    Ok(Ok(Session {
        task_dir: row.get("task_dir")?,
        pid: column_u32(row, "pid")?,
        backend: row.get("backend")?,
        started_at: row.get("started_at")?,
        updated_at: row.get("updated_at")?,
        max_iterations: column_u32(row, "max_iterations")?,
        current_iteration: column_u32(row, "current_iteration")?,
        current_story: row.get("current_story")?,
        completed_stories: column_u32(row, "completed_stories")?,
        total_stories: column_u32(row, "total_stories")?,
        status,
        name,
    }))
}
