//! Multi-agent launches described by `.ppg/swarms/<name>.json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::{self, PromptSource, SpawnRequest, SpawnTarget, SpawnedAgent};
use crate::error::{PpgError, Result};
use crate::project::Project;
use crate::worktree::WorktreeSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmStrategy {
    /// All agents work in one worktree.
    #[default]
    Shared,
    /// One worktree per agent.
    #[serde(alias = "batch")]
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmAgent {
    #[serde(default)]
    pub agent: Option<String>,
    /// Name of a file in `.ppg/prompts/`, without the `.md`.
    pub prompt: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub strategy: SwarmStrategy,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub agents: Vec<SwarmAgent>,
}

impl SwarmDefinition {
    pub fn parse(source: &str) -> Result<Self> {
        let def: SwarmDefinition = serde_json::from_str(source)
            .map_err(|e| PpgError::InvalidArgs(format!("invalid swarm definition: {}", e)))?;
        if def.agents.is_empty() {
            return Err(PpgError::InvalidArgs(format!("swarm {} has no agents", def.name)));
        }
        Ok(def)
    }
}

pub fn load_swarm(project: &Project, name: &str) -> Result<SwarmDefinition> {
    SwarmDefinition::parse(&project.templates().load_swarm_source(name)?)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmOptions {
    /// Run a shared swarm inside this existing worktree instead of a new one.
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    /// Worktree name (or prefix, for isolated swarms); defaults to the swarm name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmResult {
    pub swarm: String,
    pub strategy: SwarmStrategy,
    pub worktrees: Vec<WorktreeSummary>,
    pub agents: Vec<SpawnedAgent>,
}

pub fn run_swarm(project: &Project, name: &str, opts: SwarmOptions) -> Result<SwarmResult> {
    let def = load_swarm(project, name)?;
    // Fail on a missing prompt before any worktree exists.
    let templates = project.templates();
    for member in &def.agents {
        templates.load_prompt(&member.prompt)?;
    }
    if def.strategy == SwarmStrategy::Isolated && opts.worktree.is_some() {
        return Err(PpgError::InvalidArgs(
            "isolated swarms create their own worktrees; drop --worktree".to_string(),
        ));
    }

    let base_name = opts.name.clone().unwrap_or_else(|| def.name.clone());
    let mut result = SwarmResult {
        swarm: def.name.clone(),
        strategy: def.strategy,
        worktrees: Vec::new(),
        agents: Vec::new(),
    };

    let mut shared_worktree = opts.worktree.clone();
    for (i, member) in def.agents.iter().enumerate() {
        let target = match def.strategy {
            SwarmStrategy::Shared => match &shared_worktree {
                Some(id) => SpawnTarget::Worktree(id.clone()),
                None => SpawnTarget::NewWorktree {
                    name: Some(base_name.clone()),
                    base: opts.base.clone(),
                },
            },
            SwarmStrategy::Isolated => SpawnTarget::NewWorktree {
                name: Some(format!("{}-{}", base_name, i + 1)),
                base: opts.base.clone(),
            },
        };

        let mut vars = def.vars.clone();
        vars.extend(member.vars.clone());
        vars.extend(opts.vars.clone());

        let spawned = agent::spawn(
            project,
            SpawnRequest {
                target,
                agent_type: member.agent.clone(),
                prompt: PromptSource::Named(member.prompt.clone()),
                vars,
                count: 1,
                name: member.name.clone(),
            },
        )?;

        if let Some(wt) = spawned.worktree {
            if shared_worktree.is_none() && def.strategy == SwarmStrategy::Shared {
                shared_worktree = Some(wt.id.clone());
            }
            if !result.worktrees.iter().any(|w| w.id == wt.id) {
                result.worktrees.push(wt);
            }
        }
        result.agents.extend(spawned.agents);
    }

    tracing::info!(
        "Swarm {} started {} agents in {} worktrees",
        def.name,
        result.agents.len(),
        result.worktrees.len()
    );
    Ok(result)
}
