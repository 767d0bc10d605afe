use std::path::{Path, PathBuf};

/// Environment variable that relocates all ralph runtime state.
pub const DATA_DIR_ENV: &str = "RALPH_DATA_DIR";

const PRD_FILENAME: &str = "prd.json";
const PROGRESS_FILENAME: &str = "progress.txt";

/// Resolve the runtime data directory.
///
/// Prefers `$RALPH_DATA_DIR` when set, otherwise `~/.local/share/ralph`.
/// Falls back to the system temp dir when `HOME` is unset so daemons started
/// from minimal environments still get a usable location.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("ralph"),
        None => std::env::temp_dir().join("ralph"),
    }
}

/// Path of the session registry database.
pub fn registry_db(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions.db")
}

/// Per-session runtime directory (socket, job log, output log, execution log).
pub fn session_dir(data_dir: &Path, session: &str) -> PathBuf {
    data_dir.join("sessions").join(session)
}

pub fn control_socket(data_dir: &Path, session: &str) -> PathBuf {
    session_dir(data_dir, session).join("control.sock")
}

pub fn output_log(data_dir: &Path, session: &str) -> PathBuf {
    session_dir(data_dir, session).join("output.log")
}

pub fn execution_log(data_dir: &Path, session: &str) -> PathBuf {
    session_dir(data_dir, session).join("execution.jsonl")
}

pub fn job_log(data_dir: &Path, session: &str) -> PathBuf {
    session_dir(data_dir, session).join("job.log")
}

pub fn prd_file(task_dir: &Path) -> PathBuf {
    task_dir.join(PRD_FILENAME)
}

pub fn progress_file(task_dir: &Path) -> PathBuf {
    task_dir.join(PROGRESS_FILENAME)
}

/// Project root for a task directory laid out as `<project>/tasks/<name>/`.
pub fn project_root(task_dir: &Path) -> PathBuf {
    task_dir
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| task_dir.to_path_buf())
}

/// Derive the registry session name from a task directory.
///
/// Uses the final path component, lowercased, with runs of anything that is
/// not alphanumeric, `-` or `_` collapsed to a single dash.
pub fn session_name(task_dir: &Path) -> String {
    let raw = task_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut out = String::new();
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let slug = out.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
