//! Persisted project state: worktrees, agents, and their lifecycles.

mod store;

pub use store::{
    FileBackend, LockHandle, ManifestBackend, ManifestObserver, ManifestStore, MemoryBackend,
};

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PpgError, Result};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    Active,
    Merging,
    Merged,
    Failed,
    Cleaned,
}

impl WorktreeStatus {
    /// `active → merging → {merged | failed}`; any non-merged state may be cleaned.
    pub fn can_transition_to(self, next: WorktreeStatus) -> bool {
        use WorktreeStatus::*;
        matches!(
            (self, next),
            (Active, Merging)
                | (Merging, Merged)
                | (Merging, Failed)
                | (Active, Cleaned)
                | (Merging, Cleaned)
                | (Failed, Cleaned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Cleaned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Cleaned => "cleaned",
        }
    }
}

/// Agent lifecycle. Older manifests wrote `idle`, `exited` and `gone`; those are
/// folded into their canonical variants when read and never written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    #[serde(alias = "idle")]
    Running,
    Waiting,
    #[serde(alias = "exited")]
    Completed,
    Failed,
    Killed,
    #[serde(alias = "gone")]
    Lost,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed | Self::Lost)
    }

    /// Terminal, or parked at a prompt with its result written.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Waiting
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Lost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub tmux_target: String,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeEntry {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub tmux_window: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
}

impl WorktreeEntry {
    /// Move to `next`, rejecting edges outside the worktree state machine.
    /// There are no self-edges: re-entering the current status is an error.
    pub fn transition(&mut self, next: WorktreeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PpgError::InvalidArgs(format!(
                "worktree {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        if next == WorktreeStatus::Merged {
            self.merged_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn running_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub project_root: PathBuf,
    pub session_name: String,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    #[serde(default)]
    pub worktrees: BTreeMap<String, WorktreeEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where an agent entry lives inside the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentLocation {
    Root,
    Worktree(String),
}

impl Manifest {
    pub fn new(project_root: PathBuf, session_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            project_root,
            session_name: session_name.into(),
            agents: BTreeMap::new(),
            worktrees: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn worktree(&self, id: &str) -> Result<&WorktreeEntry> {
        self.worktrees
            .get(id)
            .ok_or_else(|| PpgError::WorktreeNotFound(id.to_string()))
    }

    pub fn worktree_mut(&mut self, id: &str) -> Result<&mut WorktreeEntry> {
        self.worktrees
            .get_mut(id)
            .ok_or_else(|| PpgError::WorktreeNotFound(id.to_string()))
    }

    /// Resolve a worktree by id or, failing that, by name (latest non-cleaned wins).
    pub fn resolve_worktree(&self, id_or_name: &str) -> Result<&WorktreeEntry> {
        if let Some(wt) = self.worktrees.get(id_or_name) {
            return Ok(wt);
        }
        self.worktrees
            .values()
            .filter(|wt| wt.name == id_or_name && wt.status != WorktreeStatus::Cleaned)
            .max_by_key(|wt| wt.created_at)
            .ok_or_else(|| PpgError::WorktreeNotFound(id_or_name.to_string()))
    }

    pub fn find_agent(&self, id: &str) -> Option<(AgentLocation, &AgentEntry)> {
        if let Some(agent) = self.agents.get(id) {
            return Some((AgentLocation::Root, agent));
        }
        self.worktrees.values().find_map(|wt| {
            wt.agents
                .get(id)
                .map(|a| (AgentLocation::Worktree(wt.id.clone()), a))
        })
    }

    pub fn agent(&self, id: &str) -> Result<(AgentLocation, &AgentEntry)> {
        self.find_agent(id)
            .ok_or_else(|| PpgError::AgentNotFound(id.to_string()))
    }

    pub fn agent_mut(&mut self, id: &str) -> Result<&mut AgentEntry> {
        if let Some(agent) = self.agents.get_mut(id) {
            return Ok(agent);
        }
        self.worktrees
            .values_mut()
            .find_map(|wt| wt.agents.get_mut(id))
            .ok_or_else(|| PpgError::AgentNotFound(id.to_string()))
    }

    pub fn insert_agent(&mut self, location: &AgentLocation, agent: AgentEntry) -> Result<()> {
        if self.find_agent(&agent.id).is_some() {
            return Err(PpgError::InvalidArgs(format!("duplicate agent id {}", agent.id)));
        }
        match location {
            AgentLocation::Root => {
                self.agents.insert(agent.id.clone(), agent);
            }
            AgentLocation::Worktree(wt_id) => {
                self.worktree_mut(wt_id)?.agents.insert(agent.id.clone(), agent);
            }
        }
        Ok(())
    }

    pub fn remove_agent(&mut self, id: &str) -> Option<AgentEntry> {
        if let Some(agent) = self.agents.remove(id) {
            return Some(agent);
        }
        self.worktrees.values_mut().find_map(|wt| wt.agents.remove(id))
    }

    /// Every agent paired with the worktree that holds it (`None` for root agents).
    pub fn all_agents(&self) -> Vec<(Option<&WorktreeEntry>, &AgentEntry)> {
        self.agents
            .values()
            .map(|a| (None, a))
            .chain(
                self.worktrees
                    .values()
                    .flat_map(|wt| wt.agents.values().map(move |a| (Some(wt), a))),
            )
            .collect()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.worktrees.contains_key(id) || self.find_agent(id).is_some()
    }

    /// Agent ids must be unique across root and every worktree.
    pub fn check_unique_agent_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (_, agent) in self.all_agents() {
            if !seen.insert(agent.id.as_str()) {
                return Err(PpgError::InvalidArgs(format!(
                    "agent id {} appears more than once",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

pub fn generate_worktree_id() -> String {
    format!("wt-{}", &uuid::Uuid::new_v4().simple().to_string()[..6])
}

pub fn generate_agent_id() -> String {
    format!("ag-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Draw ids until one is free in `manifest`.
pub fn unique_id(manifest: &Manifest, generate: fn() -> String) -> String {
    loop {
        let id = generate();
        if !manifest.contains_id(&id) {
            return id;
        }
    }
}
