use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::registry::{AgentRegistry, AgentType, LaunchInput};
use super::variant;
use crate::error::{PpgError, Result};
use crate::git;
use crate::manifest::{
    generate_agent_id, unique_id, AgentEntry, AgentLocation, AgentStatus, Manifest, WorktreeEntry,
    WorktreeStatus,
};
use crate::project::Project;
use crate::session::{CaptureScope, SendOptions};
use crate::storage::{validate_name, PromptDelivery};
use crate::templates::{self, PromptContext};
use crate::worktree::{self, WorktreeSummary};

const MAX_SPAWN_COUNT: usize = 16;

/// Time an interactive agent gets to draw its input box before the prompt is typed.
const KEYS_PROMPT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum SpawnTarget {
    /// Create a worktree first; the name defaults to `task-<hex>`.
    NewWorktree {
        name: Option<String>,
        base: Option<String>,
    },
    /// An existing worktree, by id or name.
    Worktree(String),
    ProjectRoot,
}

#[derive(Debug, Clone, Default)]
pub enum PromptSource {
    #[default]
    None,
    Inline(String),
    /// A file anywhere; relative paths resolve against the project root.
    File(PathBuf),
    /// `.ppg/templates/<name>.md`
    Template(String),
    /// `.ppg/prompts/<name>.md`
    Named(String),
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub target: SpawnTarget,
    pub agent_type: Option<String>,
    pub prompt: PromptSource,
    pub vars: HashMap<String, String>,
    pub count: usize,
    pub name: Option<String>,
}

impl Default for SpawnRequest {
    fn default() -> Self {
        Self {
            target: SpawnTarget::NewWorktree {
                name: None,
                base: None,
            },
            agent_type: None,
            prompt: PromptSource::None,
            vars: HashMap::new(),
            count: 1,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedAgent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub tmux_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeSummary>,
    pub agents: Vec<SpawnedAgent>,
}

fn load_prompt_source(project: &Project, source: &PromptSource) -> Result<String> {
    match source {
        PromptSource::None => Ok(String::new()),
        PromptSource::Inline(text) => Ok(text.clone()),
        PromptSource::File(path) => {
            let path = project.resolve_path(path);
            if !path.is_file() {
                return Err(PpgError::PromptNotFound(path.display().to_string()));
            }
            Ok(fs::read_to_string(path)?)
        }
        PromptSource::Template(name) => project.templates().load_template(name),
        PromptSource::Named(name) => project.templates().load_prompt(name),
    }
}

fn resolve_type(registry: &AgentRegistry, requested: Option<&str>) -> Result<AgentType> {
    let name = requested.unwrap_or(registry.default_agent());
    // Unknown types run their own name as a command, so keep it a plain word.
    validate_name(name)?;
    Ok(registry.resolve(name))
}

fn default_task_name() -> String {
    format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..6])
}

/// Where a batch of agents will run.
struct Placement {
    location: AgentLocation,
    worktree: Option<WorktreeEntry>,
    window: String,
    cwd: PathBuf,
    /// The pane a freshly created window opened with; used by the first agent.
    fresh_pane: Option<String>,
}

/// Start `count` agents. Each one is persisted as `spawning` before anything
/// is typed into its pane, then flipped to `running`.
pub fn spawn(project: &Project, req: SpawnRequest) -> Result<SpawnResult> {
    if req.count == 0 || req.count > MAX_SPAWN_COUNT {
        return Err(PpgError::InvalidArgs(format!(
            "count must be between 1 and {}",
            MAX_SPAWN_COUNT
        )));
    }
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    if req.agent_type.as_deref() == Some(variant::WORKTREE.id) {
        return spawn_bare_worktree(project, &req);
    }
    let registry = project.registry();
    let agent_type = resolve_type(&registry, req.agent_type.as_deref())?;
    let template = load_prompt_source(project, &req.prompt)?;

    let mut placement = place(project, &req.target)?;
    let mut agents = Vec::with_capacity(req.count);
    for i in 0..req.count {
        let pane = match placement.fresh_pane.take() {
            Some(pane) => pane,
            None => project.mux.create_pane(&placement.window, &placement.cwd)?,
        };
        let name = match (&req.name, req.count) {
            (Some(n), 1) => n.clone(),
            (Some(n), _) => format!("{}-{}", n, i + 1),
            (None, 1) => agent_type.name.clone(),
            (None, _) => format!("{}-{}", agent_type.name, i + 1),
        };
        agents.push(launch_in_pane(
            project,
            &registry,
            &agent_type,
            &placement,
            pane,
            &template,
            &req.vars,
            name,
        )?);
    }

    Ok(SpawnResult {
        worktree: placement.worktree.as_ref().map(WorktreeSummary::from),
        agents,
    })
}

/// The `worktree` type: a new checkout and window with no agent in it.
fn spawn_bare_worktree(project: &Project, req: &SpawnRequest) -> Result<SpawnResult> {
    let (name, base) = match &req.target {
        SpawnTarget::NewWorktree { name, base } => (name.clone(), base.clone()),
        _ => {
            return Err(PpgError::InvalidArgs(
                "the worktree type only creates new worktrees".to_string(),
            ))
        }
    };
    if !matches!(req.prompt, PromptSource::None) {
        return Err(PpgError::InvalidArgs(
            "the worktree type takes no prompt".to_string(),
        ));
    }
    let name = name.unwrap_or_else(default_task_name);
    let created = worktree::create(project, &name, base.as_deref())?;
    Ok(SpawnResult {
        worktree: Some(WorktreeSummary::from(&created.entry)),
        agents: Vec::new(),
    })
}

fn place(project: &Project, target: &SpawnTarget) -> Result<Placement> {
    match target {
        SpawnTarget::NewWorktree { name, base } => {
            let name = name.clone().unwrap_or_else(default_task_name);
            let created = worktree::create(project, &name, base.as_deref())?;
            Ok(Placement {
                location: AgentLocation::Worktree(created.entry.id.clone()),
                window: created.entry.tmux_window.clone(),
                cwd: created.entry.path.clone(),
                worktree: Some(created.entry),
                fresh_pane: Some(created.pane),
            })
        }
        SpawnTarget::Worktree(id) => {
            let wt = project.manifest()?.resolve_worktree(id)?.clone();
            if wt.status != WorktreeStatus::Active {
                return Err(PpgError::InvalidArgs(format!(
                    "worktree {} is {}; agents can only join active worktrees",
                    wt.id,
                    wt.status.as_str()
                )));
            }
            let (window, fresh_pane) = window_for(project, &wt)?;
            Ok(Placement {
                location: AgentLocation::Worktree(wt.id.clone()),
                window,
                cwd: wt.path.clone(),
                worktree: Some(wt),
                fresh_pane,
            })
        }
        SpawnTarget::ProjectRoot => {
            let root = project.root().to_path_buf();
            project.mux.ensure_session(project.session_name(), &root)?;
            let created = project.mux.create_window(project.session_name(), "root", &root)?;
            Ok(Placement {
                location: AgentLocation::Root,
                worktree: None,
                window: created.window,
                cwd: root,
                fresh_pane: Some(created.pane),
            })
        }
    }
}

/// The worktree's window, recreated (and re-recorded) when it has gone away.
fn window_for(project: &Project, wt: &WorktreeEntry) -> Result<(String, Option<String>)> {
    if project.mux.window_exists(&wt.tmux_window)? {
        return Ok((wt.tmux_window.clone(), None));
    }
    project.mux.ensure_session(project.session_name(), project.root())?;
    let created = project.mux.create_window(project.session_name(), &wt.name, &wt.path)?;
    let window = created.window.clone();
    project.store.with_lock(|m| {
        m.worktree_mut(&wt.id)?.tmux_window = window.clone();
        Ok(())
    })?;
    Ok((created.window, Some(created.pane)))
}

#[allow(clippy::too_many_arguments)]
fn launch_in_pane(
    project: &Project,
    registry: &AgentRegistry,
    agent_type: &AgentType,
    placement: &Placement,
    pane: String,
    template: &str,
    vars: &HashMap<String, String>,
    name: String,
) -> Result<SpawnedAgent> {
    let session_id = agent_type
        .config
        .session_id_flag
        .as_ref()
        .map(|_| uuid::Uuid::new_v4().to_string());

    let base_ctx = match &placement.worktree {
        Some(wt) => PromptContext {
            worktree_path: wt.path.display().to_string(),
            branch: wt.branch.clone(),
            task_name: wt.name.clone(),
            ..Default::default()
        },
        None => PromptContext {
            worktree_path: project.root().display().to_string(),
            branch: git::current_branch(project.root()).unwrap_or_default(),
            task_name: name.clone(),
            ..Default::default()
        },
    };
    let base_ctx = PromptContext {
        project_root: project.root().display().to_string(),
        variables: vars.clone(),
        ..base_ctx
    };

    let paths = project.paths.clone();
    let (id, prompt) = project.store.with_lock(|m| {
        let id = unique_id(m, generate_agent_id);
        let ctx = PromptContext {
            agent_id: id.clone(),
            result_file: paths.result_file(&id).display().to_string(),
            ..base_ctx
        };
        let prompt = templates::render(template, &ctx);
        let entry = AgentEntry {
            id: id.clone(),
            name: name.clone(),
            agent_type: agent_type.name.clone(),
            status: AgentStatus::Spawning,
            tmux_target: pane.clone(),
            prompt: prompt.clone(),
            started_at: Utc::now(),
            exit_code: None,
            session_id: session_id.clone(),
        };
        m.insert_agent(&placement.location, entry)?;
        Ok((id, prompt))
    })?;

    if let Err(e) = start_agent(project, registry, agent_type, &id, &pane, &prompt, session_id.as_deref()) {
        tracing::warn!("Agent {} failed to launch: {}", id, e);
        let _ = project.mux.kill_pane(&pane);
        project.store.with_lock(|m| {
            let agent = m.agent_mut(&id)?;
            if !agent.status.is_terminal() {
                agent.status = AgentStatus::Failed;
            }
            Ok(())
        })?;
        return Err(PpgError::SpawnFailed {
            agent: id,
            message: e.to_string(),
        });
    }

    project.store.with_lock(|m| {
        let agent = m.agent_mut(&id)?;
        if agent.status == AgentStatus::Spawning {
            agent.status = AgentStatus::Running;
        }
        Ok(())
    })?;
    tracing::info!("Spawned {} agent {} in {}", agent_type.name, id, pane);

    Ok(SpawnedAgent {
        id,
        name,
        agent_type: agent_type.name.clone(),
        tmux_target: pane,
        session_id,
    })
}

fn start_agent(
    project: &Project,
    registry: &AgentRegistry,
    agent_type: &AgentType,
    id: &str,
    pane: &str,
    prompt: &str,
    session_id: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(project.paths.exits_dir())?;
    let exit_file = project.paths.exit_file(id);

    let prompt_file = if agent_type.config.prompt_delivery == PromptDelivery::File && !prompt.is_empty() {
        let path = project.paths.agent_prompt_file(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, prompt)?;
        Some(path)
    } else {
        None
    };

    let plan = registry.build_launch(
        agent_type,
        &LaunchInput {
            prompt,
            prompt_file: prompt_file.as_deref(),
            exit_file: &exit_file,
            session_id,
        },
    );

    if let Some(line) = &plan.command_line {
        project.mux.send_keys(pane, line, SendOptions::default())?;
    }
    if let Some(keys) = &plan.keys_prompt {
        if plan.command_line.is_some() {
            thread::sleep(KEYS_PROMPT_DELAY);
        }
        project.mux.send_keys(pane, keys, SendOptions::default())?;
    }
    Ok(())
}

fn read_exit_code(path: &std::path::Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check one agent. Terminal entries come back unchanged.
pub fn refresh_status(project: &Project, agent: &AgentEntry) -> Result<(AgentStatus, Option<i32>)> {
    if agent.status.is_terminal() {
        return Ok((agent.status, agent.exit_code));
    }
    if let Some(code) = read_exit_code(&project.paths.exit_file(&agent.id)) {
        let status = if code == 0 {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        return Ok((status, Some(code)));
    }
    if !project.mux.is_alive(&agent.tmux_target)? {
        return Ok((AgentStatus::Lost, None));
    }
    if project.paths.result_file(&agent.id).exists() {
        return Ok((AgentStatus::Waiting, None));
    }
    Ok((AgentStatus::Running, None))
}

/// Refresh every non-terminal agent and return the resulting manifest.
///
/// Checks run without the lock; each change is applied only if the entry
/// still has the status it was observed with.
pub fn refresh_all(project: &Project) -> Result<Manifest> {
    let manifest = project.manifest()?;
    let mut changes = Vec::new();
    for (_, agent) in manifest.all_agents() {
        if agent.status.is_terminal() {
            continue;
        }
        let (status, code) = refresh_status(project, agent)?;
        if status != agent.status || code != agent.exit_code {
            changes.push((agent.id.clone(), agent.status, status, code));
        }
    }
    if changes.is_empty() {
        return Ok(manifest);
    }

    project.store.with_lock(|m| {
        for (id, observed_from, status, code) in &changes {
            if let Ok(agent) = m.agent_mut(id) {
                if agent.status == *observed_from {
                    tracing::debug!("Agent {}: {} -> {}", id, observed_from.as_str(), status.as_str());
                    agent.status = *status;
                    agent.exit_code = *code;
                }
            }
        }
        Ok(m.clone())
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartOptions {
    pub prompt: Option<String>,
    pub agent_type: Option<String>,
}

/// Re-run a finished agent as a new entry in a new window of the same worktree.
pub fn restart(project: &Project, agent_id: &str, opts: RestartOptions) -> Result<SpawnResult> {
    let manifest = refresh_all(project)?;
    let (location, old) = manifest.agent(agent_id)?;
    let old = old.clone();
    if !old.status.is_terminal() {
        return Err(PpgError::AgentsRunning {
            scope: old.id.clone(),
            agents: vec![old.id.clone()],
        });
    }

    let worktree = match &location {
        AgentLocation::Worktree(wt_id) => {
            let wt = manifest.worktree(wt_id)?.clone();
            if wt.status != WorktreeStatus::Active {
                return Err(PpgError::InvalidArgs(format!(
                    "worktree {} is {}; cannot restart agents in it",
                    wt.id,
                    wt.status.as_str()
                )));
            }
            Some(wt)
        }
        AgentLocation::Root => None,
    };

    let registry = project.registry();
    let agent_type = resolve_type(&registry, Some(opts.agent_type.as_deref().unwrap_or(&old.agent_type)))?;
    let template = opts.prompt.unwrap_or_else(|| old.prompt.clone());

    let _ = project.mux.kill_pane(&old.tmux_target);
    let cwd = worktree
        .as_ref()
        .map(|wt| wt.path.clone())
        .unwrap_or_else(|| project.root().to_path_buf());
    let label = worktree.as_ref().map(|wt| wt.name.as_str()).unwrap_or("root");
    project.mux.ensure_session(project.session_name(), project.root())?;
    let created = project.mux.create_window(project.session_name(), label, &cwd)?;

    if let Some(wt) = &worktree {
        if !project.mux.window_exists(&wt.tmux_window)? {
            let window = created.window.clone();
            project.store.with_lock(|m| {
                m.worktree_mut(&wt.id)?.tmux_window = window;
                Ok(())
            })?;
        }
    }

    let placement = Placement {
        location,
        worktree: worktree.clone(),
        window: created.window,
        cwd,
        fresh_pane: None,
    };
    let spawned = launch_in_pane(
        project,
        &registry,
        &agent_type,
        &placement,
        created.pane,
        &template,
        &HashMap::new(),
        old.name.clone(),
    )?;
    tracing::info!("Restarted {} as {}", old.id, spawned.id);

    Ok(SpawnResult {
        worktree: worktree.as_ref().map(WorktreeSummary::from),
        agents: vec![spawned],
    })
}

#[derive(Debug, Clone)]
pub enum KillTarget {
    Agent(String),
    Worktree(String),
    All,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KillOptions {
    /// Tear the worktrees in scope down (status `cleaned`).
    pub remove: bool,
    /// Drop the entries from the manifest. Implies `remove` for worktrees.
    pub delete: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResult {
    pub killed: Vec<String>,
    /// True when at least one worktree was torn down.
    pub removed: bool,
    pub removed_worktrees: Vec<String>,
    pub deleted: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn kill(project: &Project, target: KillTarget, opts: KillOptions) -> Result<KillResult> {
    let manifest = project.manifest()?;
    let (agents, worktrees): (Vec<AgentEntry>, Vec<WorktreeEntry>) = match &target {
        KillTarget::Agent(id) => {
            let (_, agent) = manifest.agent(id)?;
            (vec![agent.clone()], Vec::new())
        }
        KillTarget::Worktree(id) => {
            let wt = manifest.resolve_worktree(id)?;
            (wt.agents.values().cloned().collect(), vec![wt.clone()])
        }
        KillTarget::All => (
            manifest.all_agents().into_iter().map(|(_, a)| a.clone()).collect(),
            manifest.worktrees.values().cloned().collect(),
        ),
    };

    let mut result = KillResult::default();
    for agent in &agents {
        if let Err(e) = project.mux.kill_pane(&agent.tmux_target) {
            result.warnings.push(format!("kill {}: {}", agent.id, e));
            continue;
        }
        if !agent.status.is_terminal() {
            result.killed.push(agent.id.clone());
        }
    }

    let remove = opts.remove || opts.delete;
    if remove {
        for wt in &worktrees {
            result.warnings.extend(worktree::teardown(project, wt));
            result.removed_worktrees.push(wt.id.clone());
        }
        if !worktrees.is_empty() {
            if let Err(e) = git::worktree_prune(project.root()) {
                result.warnings.push(format!("git worktree prune: {}", e));
            }
        }
    }

    let killed = result.killed.clone();
    result.removed = !result.removed_worktrees.is_empty();
    let removed = result.removed_worktrees.clone();
    result.deleted = project.store.with_lock(|m| {
        for id in &killed {
            if let Ok(agent) = m.agent_mut(id) {
                if !agent.status.is_terminal() {
                    agent.status = AgentStatus::Killed;
                }
            }
        }
        for id in &removed {
            if let Ok(wt) = m.worktree_mut(id) {
                if wt.status.can_transition_to(WorktreeStatus::Cleaned) {
                    wt.transition(WorktreeStatus::Cleaned)?;
                }
            }
        }

        let mut deleted = Vec::new();
        if opts.delete {
            match &target {
                KillTarget::Agent(id) => {
                    if m.remove_agent(id).is_some() {
                        deleted.push(id.clone());
                    }
                }
                KillTarget::Worktree(_) | KillTarget::All => {
                    for id in &removed {
                        if m.worktrees.remove(id).is_some() {
                            deleted.push(id.clone());
                        }
                    }
                    if matches!(target, KillTarget::All) {
                        deleted.extend(std::mem::take(&mut m.agents).into_keys());
                    }
                }
            }
        }
        Ok(deleted)
    })?;

    tracing::info!("Killed {} agents", result.killed.len());
    Ok(result)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub text: String,
    /// Interpret `text` as tmux key names (`C-c`, `Escape`) instead of literal text.
    #[serde(default)]
    pub keys: bool,
    #[serde(default = "default_true")]
    pub append_enter: bool,
}

fn default_true() -> bool {
    true
}

pub fn send(project: &Project, agent_id: &str, req: &SendRequest) -> Result<()> {
    let manifest = project.manifest()?;
    let (_, agent) = manifest.agent(agent_id)?;
    if !project.mux.is_alive(&agent.tmux_target)? {
        return Err(PpgError::InvalidArgs(format!(
            "pane {} of agent {} is gone",
            agent.tmux_target, agent.id
        )));
    }
    project.mux.send_keys(
        &agent.tmux_target,
        &req.text,
        SendOptions {
            literal: !req.keys,
            append_enter: req.append_enter,
        },
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResult {
    pub agent_id: String,
    pub status: AgentStatus,
    pub tmux_target: String,
    pub lines: usize,
    pub output: String,
}

pub fn logs(project: &Project, agent_id: &str, lines: Option<usize>) -> Result<LogsResult> {
    let manifest = project.manifest()?;
    let (_, agent) = manifest.agent(agent_id)?;
    let lines = lines.unwrap_or(project.config.capture_lines);
    let output = project
        .mux
        .capture(&agent.tmux_target, CaptureScope::Lines(lines))?;
    Ok(LogsResult {
        agent_id: agent.id.clone(),
        status: agent.status,
        tmux_target: agent.tmux_target.clone(),
        lines,
        output,
    })
}

#[derive(Debug, Clone)]
pub enum WaitScope {
    /// Agents that were not yet terminal when the wait began.
    All,
    Worktree(String),
    Agents(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitedAgent {
    pub id: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Block until every targeted agent is terminal or waiting.
pub fn wait(project: &Project, scope: WaitScope, opts: WaitOptions) -> Result<Vec<WaitedAgent>> {
    let manifest = refresh_all(project)?;
    let targets: Vec<String> = match &scope {
        WaitScope::All => manifest
            .all_agents()
            .into_iter()
            .filter(|(_, a)| !a.status.is_terminal())
            .map(|(_, a)| a.id.clone())
            .collect(),
        WaitScope::Worktree(id) => manifest.resolve_worktree(id)?.agents.keys().cloned().collect(),
        WaitScope::Agents(ids) => {
            for id in ids {
                manifest.agent(id)?;
            }
            ids.clone()
        }
    };

    let started = Instant::now();
    let mut manifest = manifest;
    loop {
        let snapshot: Vec<WaitedAgent> = targets
            .iter()
            .filter_map(|id| manifest.find_agent(id))
            .map(|(_, a)| WaitedAgent {
                id: a.id.clone(),
                status: a.status,
                exit_code: a.exit_code,
            })
            .collect();
        let pending: Vec<String> = snapshot
            .iter()
            .filter(|a| !a.status.is_settled())
            .map(|a| a.id.clone())
            .collect();

        if pending.is_empty() {
            let failed: Vec<String> = snapshot
                .iter()
                .filter(|a| a.status.is_failure())
                .map(|a| a.id.clone())
                .collect();
            if !failed.is_empty() {
                return Err(PpgError::AgentsFailed { failed });
            }
            return Ok(snapshot);
        }

        if let Some(timeout) = opts.timeout {
            if started.elapsed() >= timeout {
                return Err(PpgError::WaitTimeout { pending });
            }
        }
        thread::sleep(opts.interval);
        match refresh_all(project) {
            Ok(fresh) => manifest = fresh,
            Err(e) if e.is_retryable() => {
                tracing::debug!("Wait poll skipped: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testutil::{finish_agent, hashmap, test_project, write_result};

    fn spawn_new(project: &Project, name: &str) -> SpawnResult {
        spawn(
            project,
            SpawnRequest {
                target: SpawnTarget::NewWorktree {
                    name: Some(name.to_string()),
                    base: None,
                },
                prompt: PromptSource::Inline("Work on {{BRANCH}}, write {{RESULT_FILE}}".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_spawn_persists_running_agent() {
        let (_repo, project, mux) = test_project();
        let out = spawn_new(&project, "feature-x");
        let wt = out.worktree.unwrap();
        let agent = &out.agents[0];
        assert!(agent.id.starts_with("ag-"));
        assert!(agent.session_id.is_some());

        let manifest = project.manifest().unwrap();
        let entry = &manifest.worktrees[&wt.id].agents[&agent.id];
        assert_eq!(entry.status, AgentStatus::Running);
        assert!(entry.prompt.contains("ppg/feature-x"));
        assert!(entry.prompt.contains(&format!("results/{}.md", agent.id)));

        let sent = mux.sent(&agent.tmux_target);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("claude --dangerously-skip-permissions --session-id"));
        assert!(sent[0].ends_with(&format!("exits/{}", agent.id)));
    }

    #[test]
    fn test_worktree_type_creates_an_empty_worktree() {
        let (_repo, project, mux) = test_project();
        let out = spawn(
            &project,
            SpawnRequest {
                target: SpawnTarget::NewWorktree {
                    name: Some("scratch".to_string()),
                    base: None,
                },
                agent_type: Some("worktree".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.agents.is_empty());
        let wt = out.worktree.unwrap();
        assert_eq!(wt.name, "scratch");
        assert_eq!(mux.window_count(), 1);
        assert!(project.manifest().unwrap().worktrees[&wt.id].agents.is_empty());

        let err = spawn(
            &project,
            SpawnRequest {
                target: SpawnTarget::ProjectRoot,
                agent_type: Some("worktree".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
    }

    #[test]
    fn test_spawn_then_kill_then_status() {
        let (_repo, project, mux) = test_project();
        let out = spawn_new(&project, "feature-x");
        let wt_id = out.worktree.unwrap().id;
        let agent_id = out.agents[0].id.clone();

        let result = kill(&project, KillTarget::Agent(agent_id.clone()), KillOptions::default()).unwrap();
        assert_eq!(result.killed, vec![agent_id.clone()]);
        assert_eq!(mux.live_panes(), 0);

        let manifest = refresh_all(&project).unwrap();
        assert_eq!(manifest.worktrees[&wt_id].agents[&agent_id].status, AgentStatus::Killed);
        assert_eq!(manifest.worktrees[&wt_id].status, WorktreeStatus::Active);
    }

    #[test]
    fn test_count_splits_panes_in_one_window() {
        let (_repo, project, mux) = test_project();
        let out = spawn(
            &project,
            SpawnRequest {
                count: 3,
                prompt: PromptSource::Inline("go".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(out.agents.len(), 3);
        assert_eq!(mux.window_count(), 1);
        assert_eq!(out.agents[1].name, "claude-2");
        let wt = out.worktree.unwrap();
        assert!(wt.name.starts_with("task-"));
    }

    #[test]
    fn test_refresh_maps_sentinels_and_dead_panes() {
        let (_repo, project, mux) = test_project();
        let out = spawn(
            &project,
            SpawnRequest {
                count: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let ids: Vec<String> = out.agents.iter().map(|a| a.id.clone()).collect();
        finish_agent(&project, &ids[0], 0);
        finish_agent(&project, &ids[1], 3);
        mux.set_dead(&out.agents[2].tmux_target);
        write_result(&project, &ids[3], "done");

        let manifest = refresh_all(&project).unwrap();
        let wt = &manifest.worktrees[&out.worktree.unwrap().id];
        assert_eq!(wt.agents[&ids[0]].status, AgentStatus::Completed);
        assert_eq!(wt.agents[&ids[0]].exit_code, Some(0));
        assert_eq!(wt.agents[&ids[1]].status, AgentStatus::Failed);
        assert_eq!(wt.agents[&ids[1]].exit_code, Some(3));
        assert_eq!(wt.agents[&ids[2]].status, AgentStatus::Lost);
        assert_eq!(wt.agents[&ids[3]].status, AgentStatus::Waiting);
    }

    #[test]
    fn test_terminal_entries_are_not_rechecked() {
        let (_repo, project, _mux) = test_project();
        let out = spawn_new(&project, "t");
        let id = out.agents[0].id.clone();
        kill(&project, KillTarget::Agent(id.clone()), KillOptions::default()).unwrap();
        finish_agent(&project, &id, 0);
        let (_, agent) = refresh_all(&project).unwrap().agent(&id).map(|(l, a)| (l, a.clone())).unwrap();
        assert_eq!(agent.status, AgentStatus::Killed);
    }

    #[test]
    fn test_launch_failure_marks_failed() {
        let (_repo, project, mux) = test_project();
        let created = worktree::create(&project, "flaky", None).unwrap();
        mux.fail_send_keys(true);
        let err = spawn(
            &project,
            SpawnRequest {
                target: SpawnTarget::Worktree(created.entry.id.clone()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SpawnFailed);
        let manifest = project.manifest().unwrap();
        let agents = &manifest.worktrees[&created.entry.id].agents;
        assert_eq!(agents.len(), 1);
        assert!(agents.values().all(|a| a.status == AgentStatus::Failed));
        // Only the window's first pane is left.
        assert_eq!(mux.live_panes(), 1);
    }

    #[test]
    fn test_concurrent_spawns_get_distinct_ids() {
        let (_repo, project, _mux) = test_project();
        let wt = worktree::create(&project, "crowd", None).unwrap().entry;

        let ids: Vec<String> = thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let project = &project;
                    let wt_id = wt.id.clone();
                    s.spawn(move || {
                        spawn(
                            project,
                            SpawnRequest {
                                target: SpawnTarget::Worktree(wt_id),
                                ..Default::default()
                            },
                        )
                        .unwrap()
                        .agents[0]
                            .id
                            .clone()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 6);
        let manifest = project.manifest().unwrap();
        assert_eq!(manifest.worktrees[&wt.id].agents.len(), 6);
        manifest.check_unique_agent_ids().unwrap();
    }

    #[test]
    fn test_spawn_in_project_root_with_template() {
        let (_repo, project, mux) = test_project();
        project
            .templates()
            .save_template("fix", "Fix {{ISSUE}} in {{PROJECT_ROOT}}")
            .unwrap();
        let out = spawn(
            &project,
            SpawnRequest {
                target: SpawnTarget::ProjectRoot,
                agent_type: Some("codex".to_string()),
                prompt: PromptSource::Template("fix".to_string()),
                vars: hashmap(&[("ISSUE", "#7")]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.worktree.is_none());
        let manifest = project.manifest().unwrap();
        let agent = &manifest.agents[&out.agents[0].id];
        assert_eq!(agent.prompt, format!("Fix #7 in {}", project.root().display()));
        assert!(mux.sent(&agent.tmux_target)[0].starts_with("codex --full-auto 'Fix #7"));
    }

    #[test]
    fn test_missing_prompt_and_bad_type_fail_before_side_effects() {
        let (_repo, project, mux) = test_project();
        let err = spawn(
            &project,
            SpawnRequest {
                prompt: PromptSource::Named("absent".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PromptNotFound);

        let err = spawn(
            &project,
            SpawnRequest {
                agent_type: Some("rm -rf /".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
        assert_eq!(mux.window_count(), 0);
        assert!(project.manifest().unwrap().worktrees.is_empty());
    }

    #[test]
    fn test_restart_requires_terminal_agent() {
        let (_repo, project, _mux) = test_project();
        let out = spawn_new(&project, "again");
        let id = out.agents[0].id.clone();

        let err = restart(&project, &id, RestartOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AgentsRunning);

        finish_agent(&project, &id, 1);
        let restarted = restart(&project, &id, RestartOptions::default()).unwrap();
        let new_id = &restarted.agents[0].id;
        assert_ne!(new_id, &id);

        let manifest = project.manifest().unwrap();
        let agents = &manifest.worktrees[&out.worktree.unwrap().id].agents;
        assert_eq!(agents[&id].status, AgentStatus::Failed);
        assert_eq!(agents[new_id].status, AgentStatus::Running);
        assert_eq!(agents[new_id].prompt, agents[&id].prompt);
    }

    #[test]
    fn test_kill_worktree_with_delete() {
        let (_repo, project, _mux) = test_project();
        let out = spawn_new(&project, "gone");
        let wt = out.worktree.unwrap();
        let result = kill(
            &project,
            KillTarget::Worktree(wt.id.clone()),
            KillOptions {
                remove: false,
                delete: true,
            },
        )
        .unwrap();
        assert_eq!(result.deleted, vec![wt.id.clone()]);
        assert!(result.removed);
        assert_eq!(result.removed_worktrees, vec![wt.id.clone()]);
        assert!(!std::path::Path::new(&wt.path).exists());
        assert!(project.manifest().unwrap().worktrees.is_empty());
    }

    #[test]
    fn test_send_and_logs() {
        let (_repo, project, mux) = test_project();
        let out = spawn_new(&project, "chat");
        let agent = &out.agents[0];
        send(
            &project,
            &agent.id,
            &SendRequest {
                text: "continue".to_string(),
                keys: false,
                append_enter: true,
            },
        )
        .unwrap();
        assert_eq!(mux.sent(&agent.tmux_target).last().unwrap(), "continue");

        let logs = logs(&project, &agent.id, Some(1)).unwrap();
        assert_eq!(logs.output, "continue");
        assert_eq!(logs.status, AgentStatus::Running);
    }

    #[test]
    fn test_wait_settles_and_reports_failures() {
        let (_repo, project, _mux) = test_project();
        let out = spawn(
            &project,
            SpawnRequest {
                count: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let a = out.agents[0].id.clone();
        let b = out.agents[1].id.clone();
        let fast = WaitOptions {
            timeout: Some(Duration::from_millis(50)),
            interval: Duration::from_millis(10),
        };

        let err = wait(&project, WaitScope::All, fast).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WaitTimeout);

        finish_agent(&project, &a, 0);
        write_result(&project, &b, "parked");
        // `a` is already terminal, so only `b` is still a target.
        let done = wait(&project, WaitScope::All, fast).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, AgentStatus::Waiting);

        finish_agent(&project, &b, 2);
        let err = wait(&project, WaitScope::Agents(vec![a, b]), fast).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AgentsFailed);
    }
}
