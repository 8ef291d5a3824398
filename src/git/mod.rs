//! Thin wrappers over the `git` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{PpgError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    pub head: String,
    pub is_bare: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    NoFf,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::NoFf => "no-ff",
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = PpgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "squash" => Ok(Self::Squash),
            "no-ff" | "noff" => Ok(Self::NoFf),
            other => Err(PpgError::InvalidArgs(format!(
                "unknown merge strategy '{}' (expected squash or no-ff)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Branch had nothing the base does not already contain.
    UpToDate,
    Conflict(Vec<String>),
}

fn git_command(args: &[&str], dir: &Path) -> Result<Output> {
    tracing::debug!("git {:?} in {}", args, dir.display());
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| PpgError::CommandFailed {
            program: "git".to_string(),
            args: args.join(" "),
            message: format!("failed to run git: {}", e),
        })
}

fn failure(args: &[&str], output: &Output) -> PpgError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let message = if !stderr.is_empty() { stderr } else { stdout };
    PpgError::CommandFailed {
        program: "git".to_string(),
        args: args.join(" "),
        message: if message.is_empty() {
            "git command failed".to_string()
        } else {
            message
        },
    }
}

/// Run git in `dir`, returning stdout or a `CommandFailed` carrying stderr.
pub fn run_git_in_dir(args: &[&str], dir: &Path) -> Result<String> {
    if !dir.exists() {
        return Err(PpgError::InvalidArgs(format!(
            "directory does not exist: {}",
            dir.display()
        )));
    }
    let output = git_command(args, dir)?;
    if !output.status.success() {
        return Err(failure(args, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| PpgError::InvalidArgs(format!("non-UTF-8 path: {}", path.display())))
}

/// Top level of the repository containing `dir`.
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    match run_git_in_dir(&["rev-parse", "--show-toplevel"], dir) {
        Ok(out) => Ok(PathBuf::from(out.trim())),
        Err(PpgError::CommandFailed { .. }) | Err(PpgError::InvalidArgs(_)) => {
            Err(PpgError::NotGitRepo(dir.to_path_buf()))
        }
        Err(e) => Err(e),
    }
}

pub fn current_branch(dir: &Path) -> Result<String> {
    let output = run_git_in_dir(&["rev-parse", "--abbrev-ref", "HEAD"], dir)?;
    let branch = output.trim();
    if branch.is_empty() || branch == "HEAD" {
        return Err(PpgError::InvalidArgs(
            "unable to determine current branch (detached HEAD?)".to_string(),
        ));
    }
    Ok(branch.to_string())
}

pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let reference = format!("refs/heads/{}", branch);
    let output = git_command(&["show-ref", "--verify", "--quiet", &reference], dir)?;
    Ok(output.status.success())
}

pub fn worktree_add(root: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    run_git_in_dir(&["worktree", "add", "-b", branch, path_arg(path)?, base], root)?;
    Ok(())
}

pub fn worktree_remove(root: &Path, path: &Path) -> Result<()> {
    run_git_in_dir(&["worktree", "remove", "--force", path_arg(path)?], root)?;
    Ok(())
}

pub fn worktree_prune(root: &Path) -> Result<()> {
    run_git_in_dir(&["worktree", "prune"], root)?;
    Ok(())
}

pub fn worktree_list(root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = run_git_in_dir(&["worktree", "list", "--porcelain"], root)?;
    parse_worktree_list(&output)
}

pub fn delete_branch(root: &Path, branch: &str) -> Result<()> {
    run_git_in_dir(&["branch", "-D", branch], root)?;
    Ok(())
}

pub fn checkout(root: &Path, branch: &str) -> Result<()> {
    run_git_in_dir(&["checkout", branch], root)?;
    Ok(())
}

/// Tracked changes only; untracked files never block a merge of unrelated paths.
pub fn has_tracked_changes(dir: &Path) -> Result<bool> {
    let status = run_git_in_dir(&["status", "--porcelain", "--untracked-files=no"], dir)?;
    Ok(!status.trim().is_empty())
}

pub fn has_any_changes(dir: &Path) -> Result<bool> {
    let status = run_git_in_dir(&["status", "--porcelain"], dir)?;
    Ok(!status.trim().is_empty())
}

/// Stage and commit everything in `dir`. Returns false when there was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    if !has_any_changes(dir)? {
        return Ok(false);
    }
    run_git_in_dir(&["add", "-A"], dir)?;
    run_git_in_dir(&["commit", "--no-verify", "-m", message], dir)?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub stat: bool,
    pub name_only: bool,
}

/// Diff `dir`'s working tree (committed and uncommitted) against `base`.
pub fn diff_worktree(dir: &Path, base: &str, opts: DiffOptions) -> Result<String> {
    let mut args = vec!["diff"];
    push_diff_flags(&mut args, opts);
    args.push(base);
    run_git_in_dir(&args, dir)
}

/// Diff a branch against the merge base with `base`, for checkouts already removed.
pub fn diff_branch(root: &Path, base: &str, branch: &str, opts: DiffOptions) -> Result<String> {
    let range = format!("{}...{}", base, branch);
    let mut args = vec!["diff"];
    push_diff_flags(&mut args, opts);
    args.push(&range);
    run_git_in_dir(&args, root)
}

fn push_diff_flags(args: &mut Vec<&str>, opts: DiffOptions) {
    if opts.name_only {
        args.push("--name-only");
    } else if opts.stat {
        args.push("--stat");
    }
}

fn conflicted_files(root: &Path) -> Result<Vec<String>> {
    let out = run_git_in_dir(&["diff", "--name-only", "--diff-filter=U"], root)?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Merge `branch` into the branch checked out at `root`.
///
/// Conflicts are reported and the merge is rolled back; nothing is ever
/// auto-resolved.
pub fn merge(root: &Path, branch: &str, strategy: MergeStrategy, message: &str) -> Result<MergeOutcome> {
    let args: Vec<&str> = match strategy {
        MergeStrategy::Squash => vec!["merge", "--squash", branch],
        MergeStrategy::NoFf => vec!["merge", "--no-ff", "--no-edit", "-m", message, branch],
    };
    let output = git_command(&args, root)?;

    if !output.status.success() {
        let files = conflicted_files(root)?;
        let rollback: &[&str] = match strategy {
            MergeStrategy::Squash => &["reset", "--merge"],
            MergeStrategy::NoFf => &["merge", "--abort"],
        };
        if let Err(e) = run_git_in_dir(rollback, root) {
            tracing::warn!("Rolling back failed merge of {} also failed: {}", branch, e);
        }
        if files.is_empty() {
            return Err(failure(&args, &output));
        }
        return Ok(MergeOutcome::Conflict(files));
    }

    if strategy == MergeStrategy::Squash {
        let staged = git_command(&["diff", "--cached", "--quiet"], root)?;
        if staged.status.success() {
            return Ok(MergeOutcome::UpToDate);
        }
        run_git_in_dir(&["commit", "--no-verify", "-m", message], root)?;
    } else if String::from_utf8_lossy(&output.stdout).contains("Already up to date") {
        return Ok(MergeOutcome::UpToDate);
    }

    Ok(MergeOutcome::Merged)
}

pub fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    let finish = |info: WorktreeInfo, out: &mut Vec<WorktreeInfo>| -> Result<()> {
        if info.path.is_empty() {
            return Err(PpgError::InvalidArgs(
                "unexpected git worktree output: missing path".to_string(),
            ));
        }
        out.push(info);
        Ok(())
    };

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            if let Some(info) = current.take() {
                finish(info, &mut worktrees)?;
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                finish(info, &mut worktrees)?;
            }
            current = Some(WorktreeInfo {
                path: path.to_string(),
                branch: String::new(),
                head: String::new(),
                is_bare: false,
            });
            continue;
        }

        let entry = current.as_mut().ok_or_else(|| {
            PpgError::InvalidArgs(format!("unexpected git worktree output: {}", line))
        })?;

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line == "bare" {
            entry.is_bare = true;
        } else if line == "detached" && entry.branch.is_empty() {
            entry.branch = "detached".to_string();
        }
    }

    if let Some(info) = current.take() {
        finish(info, &mut worktrees)?;
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit_file, init_repo};
    use std::fs;

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                      worktree /repo/.worktrees/wt-1\nHEAD def456\nbranch refs/heads/ppg/feature\n\n\
                      worktree /repo/.worktrees/wt-2\nHEAD 789abc\ndetached\n";
        let list = parse_worktree_list(output).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].branch, "main");
        assert_eq!(list[1].branch, "ppg/feature");
        assert_eq!(list[2].branch, "detached");
    }

    #[test]
    fn test_parse_worktree_list_rejects_orphan_lines() {
        assert!(parse_worktree_list("HEAD abc\n").is_err());
    }

    #[test]
    fn test_merge_strategy_parsing() {
        assert_eq!("squash".parse::<MergeStrategy>().unwrap(), MergeStrategy::Squash);
        assert_eq!("no-ff".parse::<MergeStrategy>().unwrap(), MergeStrategy::NoFf);
        assert!("rebase".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_repo_root_outside_git_is_not_git_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = repo_root(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotGitRepo);
    }

    #[test]
    fn test_worktree_add_and_remove() {
        let repo = init_repo();
        let wt_path = repo.path().join(".worktrees").join("wt-test");
        worktree_add(repo.path(), &wt_path, "ppg/test", "main").unwrap();

        assert!(wt_path.join("README.md").exists());
        assert!(branch_exists(repo.path(), "ppg/test").unwrap());
        assert_eq!(current_branch(&wt_path).unwrap(), "ppg/test");
        assert_eq!(worktree_list(repo.path()).unwrap().len(), 2);

        worktree_remove(repo.path(), &wt_path).unwrap();
        delete_branch(repo.path(), "ppg/test").unwrap();
        assert!(!wt_path.exists());
        assert!(!branch_exists(repo.path(), "ppg/test").unwrap());
    }

    #[test]
    fn test_squash_merge_and_conflict() {
        let repo = init_repo();
        let wt_path = repo.path().join(".worktrees").join("wt-m");
        worktree_add(repo.path(), &wt_path, "ppg/m", "main").unwrap();
        commit_file(&wt_path, "README.md", "from branch\n", "branch edit");

        // Diverge main on the same line.
        commit_file(repo.path(), "README.md", "from main\n", "main edit");

        let outcome = merge(repo.path(), "ppg/m", MergeStrategy::Squash, "squash").unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict(vec!["README.md".to_string()]));
        // Rolled back: nothing staged, file untouched.
        assert!(!has_tracked_changes(repo.path()).unwrap());
        assert_eq!(fs::read_to_string(repo.path().join("README.md")).unwrap(), "from main\n");
    }

    #[test]
    fn test_no_ff_merge_brings_changes() {
        let repo = init_repo();
        let wt_path = repo.path().join(".worktrees").join("wt-n");
        worktree_add(repo.path(), &wt_path, "ppg/n", "main").unwrap();
        commit_file(&wt_path, "new.txt", "hello\n", "add new");

        let outcome = merge(repo.path(), "ppg/n", MergeStrategy::NoFf, "merge n").unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo.path().join("new.txt").exists());
    }

    #[test]
    fn test_diff_worktree_includes_uncommitted_changes() {
        let repo = init_repo();
        let wt_path = repo.path().join(".worktrees").join("wt-d");
        worktree_add(repo.path(), &wt_path, "ppg/d", "main").unwrap();
        fs::write(wt_path.join("README.md"), "changed\n").unwrap();

        let names = diff_worktree(&wt_path, "main", DiffOptions { stat: false, name_only: true }).unwrap();
        assert_eq!(names.trim(), "README.md");
    }
}
