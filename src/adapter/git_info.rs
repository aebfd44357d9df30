//! Shared git-plumbing helper used by both the local and container
//! adapters via composition (spec §9: "a common git-info helper" instead
//! of a shared adapter base class).

use std::path::Path;
use tokio::process::Command;

use super::RepositoryInfo;

/// Runs `git` against `working_dir` and assembles a [`RepositoryInfo`].
/// Returns `None` when `working_dir` isn't inside a git repository, or the
/// `git` binary itself isn't available — this is a best-effort helper, not
/// a required capability.
pub async fn collect(working_dir: &Path) -> Option<RepositoryInfo> {
    let branch = run_git(working_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await?
        .trim()
        .to_string();

    let default_branch = run_git(
        working_dir,
        &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
    )
    .await
    .map(|s| s.trim().trim_start_matches("origin/").to_string())
    .unwrap_or_else(|| "main".to_string());

    let status = run_git(working_dir, &["status", "--porcelain"])
        .await
        .unwrap_or_default();

    let log = run_git(
        working_dir,
        &["log", "--oneline", "-n", "10", "--no-decorate"],
    )
    .await
    .unwrap_or_default();
    let recent_commits = log.lines().map(str::to_string).collect();

    Some(RepositoryInfo {
        branch,
        default_branch,
        status,
        recent_commits,
    })
}

async fn run_git(working_dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}
