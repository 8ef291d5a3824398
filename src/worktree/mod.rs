//! Worktree lifecycle: create, diff, merge, clean up.
//!
//! Every status change goes through [`WorktreeEntry::transition`]; git and tmux
//! calls always happen outside the manifest lock.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent;
use crate::error::{PpgError, Result};
use crate::git::{self, DiffOptions, MergeOutcome, MergeStrategy};
use crate::manifest::{
    generate_worktree_id, unique_id, AgentStatus, Manifest, WorktreeEntry, WorktreeStatus,
};
use crate::project::Project;
use crate::storage::validate_name;

/// A new worktree plus the pane its window opened with.
#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub entry: WorktreeEntry,
    pub pane: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSummary {
    pub id: String,
    pub name: String,
    pub branch: String,
    pub path: String,
    pub tmux_window: String,
}

impl From<&WorktreeEntry> for WorktreeSummary {
    fn from(wt: &WorktreeEntry) -> Self {
        Self {
            id: wt.id.clone(),
            name: wt.name.clone(),
            branch: wt.branch.clone(),
            path: wt.path.display().to_string(),
            tmux_window: wt.tmux_window.clone(),
        }
    }
}

/// Create `<prefix>/<name>` off `base` in `.worktrees/<id>` with its own tmux window.
pub fn create(project: &Project, name: &str, base: Option<&str>) -> Result<CreatedWorktree> {
    validate_name(name)?;
    let root = project.root();
    let base = match base {
        Some(b) => b.to_string(),
        None => git::current_branch(root)?,
    };
    let branch = format!("{}/{}", project.config.branch_prefix, name);
    if git::branch_exists(root, &branch)? {
        return Err(PpgError::InvalidArgs(format!(
            "branch {} already exists; pick another name",
            branch
        )));
    }

    let id = unique_id(&project.manifest()?, generate_worktree_id);
    let path = project.paths.worktree_path(&id);
    git::worktree_add(root, &path, &branch, &base)?;
    tracing::info!("Created worktree {} ({}) at {}", id, branch, path.display());

    let window = project
        .mux
        .ensure_session(project.session_name(), root)
        .and_then(|_| project.mux.create_window(project.session_name(), name, &path));
    let window = match window {
        Ok(w) => w,
        Err(e) => {
            rollback_checkout(project, &path, &branch);
            return Err(e);
        }
    };

    let entry = WorktreeEntry {
        id: id.clone(),
        name: name.to_string(),
        path: path.clone(),
        branch: branch.clone(),
        base_branch: base,
        status: WorktreeStatus::Active,
        tmux_window: window.window.clone(),
        pr_url: None,
        agents: Default::default(),
        created_at: Utc::now(),
        merged_at: None,
    };

    let stored = entry.clone();
    if let Err(e) = project.store.with_lock(move |m| {
        if m.worktrees.contains_key(&stored.id) {
            return Err(PpgError::InvalidArgs(format!("worktree id {} already taken", stored.id)));
        }
        m.worktrees.insert(stored.id.clone(), stored);
        Ok(())
    }) {
        let _ = project.mux.kill_window(&window.window);
        rollback_checkout(project, &path, &branch);
        return Err(e);
    }

    Ok(CreatedWorktree {
        entry,
        pane: window.pane,
    })
}

fn rollback_checkout(project: &Project, path: &std::path::Path, branch: &str) {
    tracing::warn!("Rolling back worktree at {}", path.display());
    if let Err(e) = git::worktree_remove(project.root(), path) {
        tracing::warn!("Rollback could not remove {}: {}", path.display(), e);
    }
    if let Err(e) = git::delete_branch(project.root(), branch) {
        tracing::warn!("Rollback could not delete {}: {}", branch, e);
    }
}

pub fn set_pr_url(project: &Project, id: &str, url: &str) -> Result<WorktreeEntry> {
    let url = url.trim();
    if url.is_empty() {
        return Err(PpgError::InvalidArgs("PR url cannot be empty".to_string()));
    }
    let id = project.manifest()?.resolve_worktree(id)?.id.clone();
    project.store.with_lock(|m| {
        let wt = m.worktree_mut(&id)?;
        wt.pr_url = Some(url.to_string());
        Ok(wt.clone())
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub worktree_id: String,
    pub branch: String,
    pub base_branch: String,
    pub output: String,
}

pub fn diff(project: &Project, id: &str, opts: DiffOptions) -> Result<DiffResult> {
    let manifest = project.manifest()?;
    let wt = manifest.resolve_worktree(id)?;
    let output = if wt.path.is_dir() {
        git::diff_worktree(&wt.path, &wt.base_branch, opts)?
    } else {
        git::diff_branch(project.root(), &wt.base_branch, &wt.branch, opts)?
    };
    Ok(DiffResult {
        worktree_id: wt.id.clone(),
        branch: wt.branch.clone(),
        base_branch: wt.base_branch.clone(),
        output,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub cleanup: bool,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub worktree_id: String,
    pub branch: String,
    pub base_branch: String,
    pub strategy: MergeStrategy,
    pub dry_run: bool,
    pub cleaned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

pub fn merge(project: &Project, id: &str, opts: MergeOptions) -> Result<MergeResult> {
    let manifest = agent::refresh_all(project)?;
    let wt = manifest.resolve_worktree(id)?.clone();

    if wt.status != WorktreeStatus::Active {
        return Err(PpgError::InvalidArgs(format!(
            "worktree {} is {}; only active worktrees can be merged",
            wt.id,
            wt.status.as_str()
        )));
    }
    let running = wt.running_agents();
    if !running.is_empty() && !opts.force {
        return Err(PpgError::AgentsRunning {
            scope: wt.id.clone(),
            agents: running,
        });
    }

    let mut result = MergeResult {
        worktree_id: wt.id.clone(),
        branch: wt.branch.clone(),
        base_branch: wt.base_branch.clone(),
        strategy: opts.strategy,
        dry_run: opts.dry_run,
        cleaned: false,
        merged_at: None,
        warnings: Vec::new(),
    };
    if !running.is_empty() {
        result
            .warnings
            .push(format!("merging with agents still running: {}", running.join(", ")));
    }
    if opts.dry_run {
        return Ok(result);
    }

    claim_merge(project, &wt.id, opts.force)?;
    let root = project.root();
    let dirty = match git::has_tracked_changes(root) {
        Ok(dirty) => dirty,
        Err(e) => {
            release_merge(project, &wt.id)?;
            return Err(e);
        }
    };
    if dirty {
        release_merge(project, &wt.id)?;
        return Err(PpgError::MergeFailed(
            "project root has uncommitted changes to tracked files".to_string(),
        ));
    }
    tracing::info!("Merging {} into {} ({})", wt.branch, wt.base_branch, opts.strategy.as_str());

    let message = format!("ppg: merge {} ({})", wt.name, wt.branch);
    let outcome = snapshot(&wt)
        .map(|committed| {
            if committed {
                result.warnings.push(
                    "uncommitted changes in the worktree were committed before merging".to_string(),
                );
            }
        })
        .and_then(|_| git::current_branch(root))
        .and_then(|current| {
            if current != wt.base_branch {
                git::checkout(root, &wt.base_branch)?;
            }
            Ok(())
        })
        .and_then(|_| git::merge(root, &wt.branch, opts.strategy, &message));

    match outcome {
        Ok(MergeOutcome::Conflict(files)) => {
            set_status(project, &wt.id, WorktreeStatus::Failed)?;
            tracing::warn!("Merge of {} conflicted in {} files", wt.branch, files.len());
            return Err(PpgError::MergeConflict {
                branch: wt.branch.clone(),
                files,
            });
        }
        Err(e) => {
            set_status(project, &wt.id, WorktreeStatus::Failed)?;
            return Err(e);
        }
        Ok(MergeOutcome::UpToDate) => {
            result
                .warnings
                .push(format!("{} had no changes relative to {}", wt.branch, wt.base_branch));
        }
        Ok(MergeOutcome::Merged) => {}
    }

    // Teardown runs while the entry still reads `merging`; `merged` is the last write.
    if opts.cleanup {
        let current = project.manifest()?.worktree(&wt.id)?.clone();
        result.warnings.extend(teardown(project, &current));
        result.cleaned = true;
    }
    let merged = project.store.with_lock(|m| {
        let entry = m.worktree_mut(&wt.id)?;
        entry.transition(WorktreeStatus::Merged)?;
        if opts.cleanup {
            for agent in entry.agents.values_mut() {
                if !agent.status.is_terminal() {
                    agent.status = AgentStatus::Killed;
                }
            }
        }
        Ok(entry.clone())
    })?;
    result.merged_at = merged.merged_at;
    tracing::info!("Merged worktree {}", wt.id);
    Ok(result)
}

/// Commit anything left uncommitted in the checkout. True when a commit was made.
fn snapshot(wt: &WorktreeEntry) -> Result<bool> {
    if !wt.path.is_dir() {
        return Ok(false);
    }
    git::commit_all(&wt.path, &format!("ppg: snapshot {} before merge", wt.name))
}

/// Move `active` to `merging` under the lock. Of concurrent callers exactly one
/// wins; the others see the entry already claimed.
fn claim_merge(project: &Project, id: &str, force: bool) -> Result<()> {
    project.store.with_lock(|m| {
        let wt = m.worktree_mut(id)?;
        if wt.status != WorktreeStatus::Active {
            return Err(PpgError::InvalidArgs(format!(
                "worktree {} is {}; only active worktrees can be merged",
                wt.id,
                wt.status.as_str()
            )));
        }
        let running = wt.running_agents();
        if !running.is_empty() && !force {
            return Err(PpgError::AgentsRunning {
                scope: wt.id.clone(),
                agents: running,
            });
        }
        wt.transition(WorktreeStatus::Merging)
    })
}

/// Hand a claim back before git has touched the base branch.
fn release_merge(project: &Project, id: &str) -> Result<()> {
    project.store.with_lock(|m| {
        let wt = m.worktree_mut(id)?;
        if wt.status == WorktreeStatus::Merging {
            wt.status = WorktreeStatus::Active;
        }
        Ok(())
    })
}

fn set_status(project: &Project, id: &str, next: WorktreeStatus) -> Result<WorktreeEntry> {
    project.store.with_lock(|m| {
        let wt = m.worktree_mut(id)?;
        wt.transition(next)?;
        Ok(wt.clone())
    })
}

/// Kill window → remove checkout → delete branch. Never fails; problems come
/// back as warnings so one stuck resource does not block the rest.
pub fn teardown(project: &Project, wt: &WorktreeEntry) -> Vec<String> {
    teardown_with(project, wt, true)
}

fn teardown_with(project: &Project, wt: &WorktreeEntry, delete_branch: bool) -> Vec<String> {
    let mut warnings = Vec::new();
    let root = project.root();

    if let Err(e) = project.mux.kill_window(&wt.tmux_window) {
        warnings.push(format!("kill window {}: {}", wt.tmux_window, e));
    }
    for agent in wt.agents.values() {
        let _ = project.mux.kill_pane(&agent.tmux_target);
    }
    if wt.path.exists() {
        if let Err(e) = git::worktree_remove(root, &wt.path) {
            warnings.push(format!("remove {}: {}", wt.path.display(), e));
        }
    }
    if delete_branch {
        match git::branch_exists(root, &wt.branch) {
            Ok(true) => {
                if let Err(e) = git::delete_branch(root, &wt.branch) {
                    warnings.push(format!("delete branch {}: {}", wt.branch, e));
                }
            }
            Ok(false) => {}
            Err(e) => warnings.push(format!("inspect branch {}: {}", wt.branch, e)),
        }
    }
    for w in &warnings {
        tracing::warn!("Teardown of {}: {}", wt.id, w);
    }
    warnings
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedWorktree {
    pub id: String,
    pub name: String,
    pub status: WorktreeStatus,
    pub warnings: Vec<String>,
}

/// Drop finished worktrees from the manifest after removing whatever is left of them.
pub fn clean(project: &Project, include_failed: bool) -> Result<Vec<CleanedWorktree>> {
    let cleanable = |s: WorktreeStatus| {
        matches!(s, WorktreeStatus::Merged | WorktreeStatus::Cleaned)
            || (include_failed && s == WorktreeStatus::Failed)
    };

    let candidates: Vec<WorktreeEntry> = project
        .manifest()?
        .worktrees
        .into_values()
        .filter(|wt| cleanable(wt.status))
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut cleaned = Vec::new();
    for wt in &candidates {
        let warnings = teardown(project, wt);
        cleaned.push(CleanedWorktree {
            id: wt.id.clone(),
            name: wt.name.clone(),
            status: wt.status,
            warnings,
        });
    }
    if let Err(e) = git::worktree_prune(project.root()) {
        tracing::warn!("git worktree prune failed: {}", e);
    }

    let ids: Vec<String> = cleaned.iter().map(|c| c.id.clone()).collect();
    let removed = project.store.with_lock(|m| {
        let mut removed = Vec::new();
        for id in &ids {
            // Only drop entries still in a cleanable state.
            if m.worktrees.get(id).map(|wt| cleanable(wt.status)).unwrap_or(false) {
                m.worktrees.remove(id);
                removed.push(id.clone());
            }
        }
        Ok(removed)
    })?;

    cleaned.retain(|c| removed.contains(&c.id));
    tracing::info!("Cleaned {} worktrees", cleaned.len());
    Ok(cleaned)
}

/// Remove git worktrees under `.worktrees/` left behind by interrupted creates.
fn remove_orphans(project: &Project, manifest: &Manifest, result: &mut ResetResult) {
    let listed = match git::worktree_list(project.root()) {
        Ok(listed) => listed,
        Err(e) => {
            result.warnings.push(format!("git worktree list: {}", e));
            return;
        }
    };
    let dir = project.paths.worktrees_dir();
    for info in listed {
        let path = Path::new(&info.path);
        if !path.starts_with(&dir) || manifest.worktrees.values().any(|wt| wt.path == path) {
            continue;
        }
        match git::worktree_remove(project.root(), path) {
            Ok(()) => {
                tracing::info!("Removed orphaned worktree {}", info.path);
                result.orphans.push(info.path);
            }
            Err(e) => result.warnings.push(format!("remove {}: {}", info.path, e)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResult {
    pub killed: Vec<String>,
    pub cleaned: Vec<String>,
    /// Checkouts under `.worktrees/` that no manifest entry owned.
    pub orphans: Vec<String>,
    pub warnings: Vec<String>,
}

const QUIESCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Kill every agent and tear down every worktree.
///
/// Refuses while completed work sits unmerged without a PR, unless `force`.
/// Branches that have a PR recorded are kept.
pub fn reset(project: &Project, force: bool) -> Result<ResetResult> {
    let manifest = agent::refresh_all(project)?;

    let unmerged: Vec<String> = manifest
        .worktrees
        .values()
        .filter(|wt| {
            !matches!(wt.status, WorktreeStatus::Merged | WorktreeStatus::Cleaned)
                && wt.pr_url.is_none()
                && wt.agents.values().any(|a| a.status == AgentStatus::Completed)
        })
        .map(|wt| wt.id.clone())
        .collect();
    if !unmerged.is_empty() && !force {
        return Err(PpgError::UnmergedWork { worktrees: unmerged });
    }

    let mut result = ResetResult::default();
    let mut panes = Vec::new();
    for (_, agent) in manifest.all_agents() {
        if let Err(e) = project.mux.kill_pane(&agent.tmux_target) {
            result.warnings.push(format!("kill {}: {}", agent.id, e));
        }
        panes.push(agent.tmux_target.clone());
        if !agent.status.is_terminal() {
            result.killed.push(agent.id.clone());
        }
    }

    let deadline = Instant::now() + QUIESCE_TIMEOUT;
    loop {
        let alive: Vec<&String> = panes
            .iter()
            .filter(|p| project.mux.is_alive(p).unwrap_or(false))
            .collect();
        if alive.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            for pane in alive {
                result.warnings.push(format!("pane {} still alive after kill", pane));
            }
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    for wt in manifest.worktrees.values() {
        if wt.status == WorktreeStatus::Cleaned {
            continue;
        }
        let keep_branch = wt.pr_url.is_some();
        result.warnings.extend(teardown_with(project, wt, !keep_branch));
        if wt.status != WorktreeStatus::Merged {
            result.cleaned.push(wt.id.clone());
        }
    }

    let cleaned = result.cleaned.clone();
    project.store.with_lock(|m| {
        for agent in m.agents.values_mut() {
            if !agent.status.is_terminal() {
                agent.status = AgentStatus::Killed;
            }
        }
        for wt in m.worktrees.values_mut() {
            for agent in wt.agents.values_mut() {
                if !agent.status.is_terminal() {
                    agent.status = AgentStatus::Killed;
                }
            }
            if cleaned.contains(&wt.id) && wt.status.can_transition_to(WorktreeStatus::Cleaned) {
                wt.transition(WorktreeStatus::Cleaned)?;
            }
        }
        Ok(())
    })?;

    remove_orphans(project, &manifest, &mut result);
    if let Err(e) = git::worktree_prune(project.root()) {
        result.warnings.push(format!("git worktree prune: {}", e));
    }
    tracing::info!(
        "Reset: {} agents killed, {} worktrees cleaned",
        result.killed.len(),
        result.cleaned.len()
    );
    Ok(result)
}
