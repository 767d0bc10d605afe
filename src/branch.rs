//! Git branch handling around a run.
//!
//! Before the first iteration the project is put on the checklist's
//! `branchName`: left alone when already there, otherwise checked out or
//! created from the base branch, which requires a clean working tree. When
//! the run completes and the checklist names a `mergeTarget`, the branch is
//! pushed and a pull request opened with `gh` (and merged when `autoMerge`
//! is set).

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::task::Task;

const GH: &str = "gh";

/// Branch settings for one run, taken from the checklist and `--base-branch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPlan {
    pub branch: String,
    pub base: Option<String>,
    pub merge_target: Option<String>,
    pub auto_merge: bool,
}

impl BranchPlan {
    /// `None` when the checklist names no branch.
    pub fn from_task(task: &Task, base: Option<&str>) -> Option<Self> {
        let branch = task.branch_name.trim();
        if branch.is_empty() {
            return None;
        }
        Some(Self {
            branch: branch.to_string(),
            base: base.filter(|b| !b.is_empty()).map(str::to_string),
            merge_target: task.merge_target.clone().filter(|t| !t.is_empty()),
            auto_merge: task.auto_merge.unwrap_or(false),
        })
    }
}

/// What `setup` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSetup {
    AlreadyOn,
    CheckedOut,
    Created { base: String },
    /// The project is not inside a git work tree; nothing was touched.
    NotARepository,
}

/// What `complete` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionAction {
    /// Pushed, with the pull request URL when one was opened.
    PullRequest { url: Option<String>, merged: bool },
}

/// Put `repo` on the plan's branch.
pub fn setup(repo: &Path, plan: &BranchPlan) -> Result<BranchSetup> {
    if !is_work_tree(repo) {
        warn!(branch = %plan.branch, dir = %repo.display(), "not a git work tree, skipping branch setup");
        return Ok(BranchSetup::NotARepository);
    }

    let current = current_branch(repo)?;
    if current == plan.branch {
        info!(branch = %plan.branch, "already on task branch");
        return Ok(BranchSetup::AlreadyOn);
    }
    if !is_clean(repo)? {
        bail!(
            "working tree has uncommitted changes; commit or stash them before switching to '{}'",
            plan.branch
        );
    }

    if branch_exists(repo, &plan.branch)? {
        info!(branch = %plan.branch, "checking out existing task branch");
        git_ok(repo, ["checkout", plan.branch.as_str()], "checkout")?;
        return Ok(BranchSetup::CheckedOut);
    }

    let base = plan.base.clone().unwrap_or(current);
    if !branch_exists(repo, &base)? {
        bail!("base branch '{base}' does not exist; pass an existing one with --base-branch");
    }
    info!(branch = %plan.branch, base = %base, "creating task branch");
    git_ok(
        repo,
        ["checkout", "-b", plan.branch.as_str(), base.as_str()],
        "create branch",
    )?;
    Ok(BranchSetup::Created { base })
}

/// Push the branch and open a pull request when the plan has a merge target.
/// Only a failed push is an error; pull request problems are logged.
pub fn complete(repo: &Path, plan: &BranchPlan) -> Result<Option<CompletionAction>> {
    complete_with(repo, plan, GH)
}

fn complete_with(repo: &Path, plan: &BranchPlan, gh: &str) -> Result<Option<CompletionAction>> {
    let Some(target) = plan.merge_target.as_deref() else {
        return Ok(None);
    };
    if !is_work_tree(repo) {
        warn!(branch = %plan.branch, "not a git work tree, skipping push");
        return Ok(None);
    }

    info!(branch = %plan.branch, "pushing task branch");
    git_ok(repo, ["push", "-u", "origin", plan.branch.as_str()], "push")?;

    let url = create_pull_request(repo, gh, &plan.branch, target);
    let merged = match &url {
        Some(url) if plan.auto_merge => merge_pull_request(repo, gh, url, target),
        _ => false,
    };
    Ok(Some(CompletionAction::PullRequest { url, merged }))
}

fn create_pull_request(repo: &Path, gh: &str, branch: &str, target: &str) -> Option<String> {
    let title = format!("Ralph: {branch}");
    let body = format!("Automated pull request from a ralph run.\n\nBranch: {branch}\nTarget: {target}");
    let output = match Command::new(gh)
        .current_dir(repo)
        .args(["pr", "create", "--base", target, "--head", branch, "--title"])
        .arg(&title)
        .arg("--body")
        .arg(&body)
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            warn!(program = gh, error = %e, "cannot open pull request");
            return None;
        }
    };
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        if stderr.contains("already exists") {
            info!(branch, "pull request already exists");
        } else {
            warn!(error = %stderr.trim(), "failed to open pull request");
        }
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!(url = %url, target, "pull request opened");
    (!url.is_empty()).then_some(url)
}

fn merge_pull_request(repo: &Path, gh: &str, url: &str, target: &str) -> bool {
    match Command::new(gh)
        .current_dir(repo)
        .args(["pr", "merge", url, "--merge", "--delete-branch"])
        .output()
    {
        Ok(output) if output.status.success() => {
            info!(url, target, "pull request merged");
            true
        }
        Ok(output) => {
            warn!(
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "failed to merge pull request"
            );
            false
        }
        Err(e) => {
            warn!(program = gh, error = %e, "cannot merge pull request");
            false
        }
    }
}

fn run_git<I, S>(repo: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git")
        .current_dir(repo)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git in {}", repo.display()))
}

fn git_ok<I, S>(repo: &Path, args: I, what: &str) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_git(repo, args)?;
    if !output.status.success() {
        bail!(
            "git {what} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// False when git is missing or `repo` is outside a work tree.
fn is_work_tree(repo: &Path) -> bool {
    run_git(repo, ["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
        .unwrap_or(false)
}

fn current_branch(repo: &Path) -> Result<String> {
    let output = run_git(repo, ["branch", "--show-current"])?;
    if !output.status.success() {
        bail!(
            "failed to determine current branch: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() {
        bail!("detached HEAD; checkout a branch before running");
    }
    Ok(branch)
}

fn is_clean(repo: &Path) -> Result<bool> {
    let output = run_git(repo, ["status", "--porcelain"])?;
    if !output.status.success() {
        bail!(
            "git status failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout.iter().all(u8::is_ascii_whitespace))
}

fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let ref_name = format!("refs/heads/{branch}");
    let output = run_git(repo, ["show-ref", "--verify", "--quiet", ref_name.as_str()])?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => bail!(
            "failed to check branch '{branch}': {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}
