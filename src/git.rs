use std::path::Path;
use std::process::Command;

use crate::error::{AppError, AppResult};
use crate::models::now_ts;
use crate::models::task::TaskGitState;

fn run_git(workspace: &Path, args: &[&str]) -> AppResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .map_err(|e| AppError::Git(format!("Failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Paths reported dirty by `git status --porcelain` (staged, unstaged and
/// untracked alike).
fn dirty_paths(workspace: &Path) -> AppResult<Vec<String>> {
    let out = run_git(workspace, &["status", "--porcelain"])?;
    Ok(out
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| line[3..].trim().to_string())
        .collect())
}

/// Snapshot taken when a task starts: the commit it runs on top of and
/// whether the tree already carried uncommitted changes.
pub fn capture_before(workspace: &Path) -> AppResult<TaskGitState> {
    let commit_before = run_git(workspace, &["rev-parse", "HEAD"])?;
    let uncommitted_before = !dirty_paths(workspace)?.is_empty();

    Ok(TaskGitState {
        commit_before,
        commit_after: None,
        uncommitted_before,
        files_modified: Vec::new(),
        can_revert: false,
        reverted_at: None,
    })
}

/// Completion snapshot: what the task touched relative to `commit_before`,
/// and whether a hard revert is still safe. Reverting is only offered when
/// the tree started clean and ended clean, so a reset cannot eat edits the
/// task does not own.
pub fn capture_after(workspace: &Path, before: &TaskGitState) -> AppResult<TaskGitState> {
    let commit_after = run_git(workspace, &["rev-parse", "HEAD"])?;

    let mut files_modified: Vec<String> = run_git(
        workspace,
        &["diff", "--name-only", &before.commit_before],
    )?
    .lines()
    .filter(|line| !line.is_empty())
    .map(str::to_string)
    .collect();

    let untracked = run_git(workspace, &["ls-files", "--others", "--exclude-standard"])?;
    files_modified.extend(untracked.lines().filter(|l| !l.is_empty()).map(str::to_string));
    files_modified.sort();
    files_modified.dedup();

    let tree_dirty = !dirty_paths(workspace)?.is_empty();

    Ok(TaskGitState {
        commit_before: before.commit_before.clone(),
        commit_after: Some(commit_after),
        uncommitted_before: before.uncommitted_before,
        files_modified,
        can_revert: !before.uncommitted_before && !tree_dirty,
        reverted_at: None,
    })
}

/// Hard-resets the workspace to `commit_before`. Every precondition is
/// re-checked here and the first violated one is named in the error; the
/// reset itself is all-or-nothing.
pub fn revert(workspace: &Path, git_state: &TaskGitState) -> AppResult<TaskGitState> {
    if git_state.reverted_at.is_some() {
        return Err(AppError::RevertPrecondition(
            "task was already reverted".into(),
        ));
    }
    let commit_after = git_state.commit_after.as_deref().ok_or_else(|| {
        AppError::RevertPrecondition("task has no completion checkpoint".into())
    })?;
    if !git_state.can_revert {
        return Err(AppError::RevertPrecondition(
            "revert is not available (uncommitted changes existed before the task or the tree was dirty at completion)"
                .into(),
        ));
    }

    let head = run_git(workspace, &["rev-parse", "HEAD"])?;
    if head != commit_after {
        return Err(AppError::RevertPrecondition(format!(
            "HEAD moved since the task completed ({} != {})",
            &head[..head.len().min(12)],
            &commit_after[..commit_after.len().min(12)]
        )));
    }
    if !dirty_paths(workspace)?.is_empty() {
        return Err(AppError::RevertPrecondition(
            "working tree has uncommitted changes".into(),
        ));
    }

    run_git(workspace, &["reset", "--hard", &git_state.commit_before])?;

    let mut reverted = git_state.clone();
    reverted.can_revert = false;
    reverted.reverted_at = Some(now_ts());
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test User"]);
        std::fs::write(dir.join("README.md"), "initial\n").expect("write");
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "init"]);
    }

    #[test]
    fn capture_before_reflects_tree_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());

        let clean = capture_before(tmp.path()).expect("capture");
        assert!(!clean.uncommitted_before);
        assert!(!clean.can_revert);

        std::fs::write(tmp.path().join("README.md"), "edited\n").expect("write");
        let dirty = capture_before(tmp.path()).expect("capture");
        assert!(dirty.uncommitted_before);
        assert_eq!(dirty.commit_before, clean.commit_before);
    }

    #[test]
    fn revert_cycle_then_second_revert_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());

        let before = capture_before(tmp.path()).expect("before");

        // The task edits and commits
        std::fs::write(tmp.path().join("README.md"), "task output\n").expect("write");
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-m", "task work"]);

        let after = capture_after(tmp.path(), &before).expect("after");
        assert!(after.can_revert);
        assert_eq!(after.files_modified, vec!["README.md".to_string()]);
        assert_ne!(after.commit_after.as_ref(), Some(&after.commit_before));

        let reverted = revert(tmp.path(), &after).expect("revert");
        assert!(!reverted.can_revert);
        assert!(reverted.reverted_at.is_some());

        let head = run_git(tmp.path(), &["rev-parse", "HEAD"]).expect("head");
        assert_eq!(head, after.commit_before);
        let contents = std::fs::read_to_string(tmp.path().join("README.md")).expect("read");
        assert_eq!(contents, "initial\n");

        let again = revert(tmp.path(), &reverted);
        assert!(matches!(again, Err(AppError::RevertPrecondition(_))));
    }

    #[test]
    fn dirty_start_never_reverts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());
        std::fs::write(tmp.path().join("notes.txt"), "wip\n").expect("write");
        git(tmp.path(), &["add", "notes.txt"]);

        let before = capture_before(tmp.path()).expect("before");
        assert!(before.uncommitted_before);

        git(tmp.path(), &["commit", "-m", "task commit"]);
        let after = capture_after(tmp.path(), &before).expect("after");
        assert!(!after.can_revert);
        assert!(matches!(
            revert(tmp.path(), &after),
            Err(AppError::RevertPrecondition(_))
        ));
    }

    #[test]
    fn head_moving_after_completion_blocks_revert() {
        let tmp = tempfile::tempdir().expect("tempdir");
        init_repo(tmp.path());

        let before = capture_before(tmp.path()).expect("before");
        std::fs::write(tmp.path().join("a.txt"), "a\n").expect("write");
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-m", "task"]);
        let after = capture_after(tmp.path(), &before).expect("after");

        // Someone else commits on top
        std::fs::write(tmp.path().join("b.txt"), "b\n").expect("write");
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-m", "external"]);

        assert!(matches!(
            revert(tmp.path(), &after),
            Err(AppError::RevertPrecondition(_))
        ));
    }

    #[test]
    fn non_repo_directories_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            capture_before(tmp.path()),
            Err(AppError::Git(_))
        ));
    }
}
