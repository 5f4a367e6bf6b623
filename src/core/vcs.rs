//! Version-control invocations.
//!
//! Thin wrappers over `git` subprocesses, routed through the external-action
//! broker. Mutating calls (branch create/switch/delete, merge) carry the
//! `VcsWrite` capability; queries carry `VcsRead`.

use crate::core::error::MagpieError;
use crate::core::external::{self, ExternalCapability, VCS_BIN};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

fn run_git(
    config_root: &Path,
    capability: ExternalCapability,
    scope: &str,
    args: &[&str],
    cwd: &Path,
) -> Result<std::process::Output, MagpieError> {
    external::execute(config_root, capability, scope, VCS_BIN, args, cwd)
}

fn stdout_str(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn stderr_str(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub fn is_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

pub fn current_branch(config_root: &Path, dir: &Path) -> Result<String, MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.current_branch",
        &["rev-parse", "--abbrev-ref", "HEAD"],
        dir,
    )?;
    if !out.status.success() {
        return Err(MagpieError::Precondition(format!(
            "not a git repository: {}",
            dir.display()
        )));
    }
    Ok(stdout_str(&out))
}

pub fn is_dirty(config_root: &Path, dir: &Path) -> Result<bool, MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.status",
        &["status", "--porcelain"],
        dir,
    )?;
    if !out.status.success() {
        return Err(MagpieError::Precondition(format!(
            "not a git repository: {}",
            dir.display()
        )));
    }
    Ok(!stdout_str(&out).is_empty())
}

pub fn branch_exists(config_root: &Path, dir: &Path, name: &str) -> Result<bool, MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.branch_list",
        &["branch", "--list", name],
        dir,
    )?;
    Ok(!stdout_str(&out).is_empty())
}

pub fn create_branch(config_root: &Path, dir: &Path, name: &str) -> Result<(), MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsWrite,
        "vcs.branch_create",
        &["checkout", "-b", name],
        dir,
    )?;
    if !out.status.success() {
        return Err(MagpieError::Precondition(format!(
            "could not create branch {}: {}",
            name,
            stderr_str(&out)
        )));
    }
    Ok(())
}

pub fn checkout(config_root: &Path, dir: &Path, name: &str) -> Result<(), MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsWrite,
        "vcs.checkout",
        &["checkout", name],
        dir,
    )?;
    if !out.status.success() {
        return Err(MagpieError::Precondition(format!(
            "could not checkout {}: {}",
            name,
            stderr_str(&out)
        )));
    }
    Ok(())
}

pub fn delete_branch(config_root: &Path, dir: &Path, name: &str) -> Result<(), MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsWrite,
        "vcs.branch_delete",
        &["branch", "-D", name],
        dir,
    )?;
    if !out.status.success() {
        return Err(MagpieError::Precondition(format!(
            "could not delete branch {}: {}",
            name,
            stderr_str(&out)
        )));
    }
    Ok(())
}

pub fn tracked_files(config_root: &Path, dir: &Path) -> Result<Vec<String>, MagpieError> {
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.ls_files",
        &["ls-files"],
        dir,
    )?;
    if !out.status.success() {
        return Ok(Vec::new());
    }
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

fn fmt_since(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Any commits after `since` on the current branch.
pub fn has_commits_since(
    config_root: &Path,
    dir: &Path,
    since: DateTime<Utc>,
) -> Result<bool, MagpieError> {
    let since_arg = format!("--since={}", fmt_since(since));
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.log_since",
        &["log", "--oneline", &since_arg, "-1"],
        dir,
    )?;
    Ok(out.status.success() && !stdout_str(&out).is_empty())
}

/// Any added/copied/modified/renamed files after `since`.
pub fn has_code_changes_since(
    config_root: &Path,
    dir: &Path,
    since: DateTime<Utc>,
) -> Result<bool, MagpieError> {
    let since_arg = format!("--since={}", fmt_since(since));
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.log_diff_filter",
        &["log", "--oneline", "--diff-filter=ACMR", &since_arg, "-1"],
        dir,
    )?;
    Ok(out.status.success() && !stdout_str(&out).is_empty())
}

/// The integration branch this repo uses: `main` if it exists, else
/// `master`, else nothing.
pub fn default_base_branch(config_root: &Path, dir: &Path) -> Result<Option<String>, MagpieError> {
    for base in ["main", "master"] {
        if branch_exists(config_root, dir, base)? {
            return Ok(Some(base.to_string()));
        }
    }
    Ok(None)
}

/// Commits on the current branch since its fork point from main/master.
pub fn commits_ahead_of_base(config_root: &Path, dir: &Path) -> Result<i64, MagpieError> {
    let Some(base) = default_base_branch(config_root, dir)? else {
        return Ok(0);
    };
    let range = format!("{}..HEAD", base);
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.rev_list_count",
        &["rev-list", "--count", &range],
        dir,
    )?;
    if !out.status.success() {
        return Ok(0);
    }
    Ok(stdout_str(&out).parse().unwrap_or(0))
}

/// Commit log of `branch` since it diverged from `base`.
pub fn branch_log(
    config_root: &Path,
    dir: &Path,
    branch: &str,
    base: &str,
) -> Result<String, MagpieError> {
    let range = format!("{}..{}", base, branch);
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.branch_log",
        &["log", "--oneline", &range],
        dir,
    )?;
    Ok(stdout_str(&out))
}

/// Diff between `base` and `branch` (three-dot: since the fork point).
pub fn branch_diff(
    config_root: &Path,
    dir: &Path,
    branch: &str,
    base: &str,
) -> Result<String, MagpieError> {
    let range = format!("{}...{}", base, branch);
    let out = run_git(
        config_root,
        ExternalCapability::VcsRead,
        "vcs.branch_diff",
        &["diff", &range],
        dir,
    )?;
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Merge `branch` into `target` with a merge commit. On failure the merge is
/// aborted and the previous checkout restored before the error surfaces.
pub fn merge_no_ff(
    config_root: &Path,
    dir: &Path,
    branch: &str,
    target: &str,
) -> Result<(), MagpieError> {
    let prior = current_branch(config_root, dir)?;
    checkout(config_root, dir, target)?;
    let message = format!("Merge wise-magpie work: {}", branch);
    let out = run_git(
        config_root,
        ExternalCapability::VcsWrite,
        "vcs.merge",
        &["merge", "--no-ff", branch, "-m", &message],
        dir,
    )?;
    if !out.status.success() {
        let detail = stderr_str(&out);
        let _ = run_git(
            config_root,
            ExternalCapability::VcsWrite,
            "vcs.merge_abort",
            &["merge", "--abort"],
            dir,
        );
        let _ = checkout(config_root, dir, &prior);
        return Err(MagpieError::Precondition(format!(
            "merge of {} into {} failed: {}",
            branch, target, detail
        )));
    }
    Ok(())
}
