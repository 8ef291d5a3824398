//! On-disk layout of a ppg project and its `config.json`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::variant;
use crate::error::{PpgError, Result};

/// Worktree and schedule names flow into paths, branch names and tmux targets.
static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").expect("Invalid name validation regex")
});

pub const MAX_NAME_LEN: usize = 64;

/// Reject anything that is not letters, digits and hyphens.
/// A leading hyphen is rejected too so a name can never be read as a git flag.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PpgError::InvalidArgs("name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PpgError::InvalidArgs(format!(
            "name is too long ({} > {} characters)",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if !NAME_REGEX.is_match(name) {
        return Err(PpgError::InvalidArgs(format!(
            "invalid name '{}': use letters, digits and hyphens only",
            name
        )));
    }
    Ok(())
}

/// Ids are generated by us, but they still come back in over HTTP.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(PpgError::InvalidArgs(format!("invalid id '{}'", id)));
    }
    Ok(())
}

/// How an agent receives its prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    /// Shell-quoted positional argument (or after `promptFlag`).
    Arg,
    /// Written to `.ppg/agent-prompts/<id>.md` and passed by path or `$(cat ...)`.
    File,
    /// Typed into the pane after the command starts.
    Keys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypeConfig {
    pub command: String,
    pub prompt_delivery: PromptDelivery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_flag: Option<String>,
    /// Flag that pins the agent's conversation id, e.g. `--session-id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 7700,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// tmux session; defaults to `ppg-<repo dir name>`.
    pub session_name: Option<String>,
    pub branch_prefix: String,
    pub default_agent: String,
    pub agents: HashMap<String, AgentTypeConfig>,
    pub api: ApiConfig,
    pub scheduler_tick_secs: u64,
    pub lock_timeout_secs: u64,
    pub capture_lines: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let agents = variant::BUILTIN
            .iter()
            .filter_map(|v| v.default_config().map(|c| (v.id.to_string(), c)))
            .collect();

        Self {
            session_name: None,
            branch_prefix: "ppg".to_string(),
            default_agent: "claude".to_string(),
            agents,
            api: ApiConfig::default(),
            scheduler_tick_secs: 30,
            lock_timeout_secs: 10,
            capture_lines: 200,
        }
    }
}

/// Paths of everything ppg keeps inside a project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ppg_dir(&self) -> PathBuf {
        self.root.join(".ppg")
    }

    pub fn config_path(&self) -> PathBuf {
        self.ppg_dir().join("config.json")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.ppg_dir().join("results")
    }

    pub fn result_file(&self, agent_id: &str) -> PathBuf {
        self.results_dir().join(format!("{}.md", agent_id))
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.ppg_dir().join("templates")
    }

    pub fn swarms_dir(&self) -> PathBuf {
        self.ppg_dir().join("swarms")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.ppg_dir().join("prompts")
    }

    pub fn agent_prompt_file(&self, agent_id: &str) -> PathBuf {
        self.ppg_dir().join("agent-prompts").join(format!("{}.md", agent_id))
    }

    pub fn exits_dir(&self) -> PathBuf {
        self.ppg_dir().join("exits")
    }

    pub fn exit_file(&self, agent_id: &str) -> PathBuf {
        self.exits_dir().join(agent_id)
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.ppg_dir().join("schedules.json")
    }

    pub fn cron_pid_path(&self) -> PathBuf {
        self.ppg_dir().join("cron.pid")
    }

    pub fn cron_log_path(&self) -> PathBuf {
        self.ppg_dir().join("logs").join("cron.log")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join(".worktrees")
    }

    pub fn worktree_path(&self, worktree_id: &str) -> PathBuf {
        self.worktrees_dir().join(worktree_id)
    }

    /// Create the directory tree and a default config if none exists.
    pub fn create_layout(&self) -> Result<()> {
        let ppg_dir = self.ppg_dir();
        for dir in [
            ppg_dir.clone(),
            self.results_dir(),
            self.templates_dir(),
            self.swarms_dir(),
            self.prompts_dir(),
            ppg_dir.join("agent-prompts"),
            self.exits_dir(),
            ppg_dir.join("logs"),
        ] {
            fs::create_dir_all(dir)?;
        }

        if !self.config_path().exists() {
            self.save_config(&AppConfig::default())?;
        }
        self.exclude_runtime_files()?;
        Ok(())
    }

    /// Keep worktrees and runtime state out of `git status` without touching
    /// tracked files.
    fn exclude_runtime_files(&self) -> Result<()> {
        let info_dir = self.root.join(".git").join("info");
        if !self.root.join(".git").is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();

        let wanted = [
            "/.worktrees/",
            "/.ppg/manifest.json",
            "/.ppg/manifest.lock",
            "/.ppg/.manifest.*",
            "/.ppg/results/",
            "/.ppg/exits/",
            "/.ppg/agent-prompts/",
            "/.ppg/logs/",
            "/.ppg/cron.pid",
        ];
        let missing: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|line| !existing.lines().any(|l| l.trim() == *line))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new().create(true).append(true).open(exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "# ppg")?;
        for line in missing {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Load the config, falling back to defaults when the file is absent.
    pub fn load_config(&self) -> Result<AppConfig> {
        let config_path = self.config_path();
        if !config_path.exists() {
            return Ok(AppConfig::default());
        }
        let json = fs::read_to_string(&config_path)?;
        serde_json::from_str(&json).map_err(|e| {
            PpgError::InvalidArgs(format!("invalid {}: {}", config_path.display(), e))
        })
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        fs::create_dir_all(self.ppg_dir())?;
        fs::write(self.config_path(), json)?;
        Ok(())
    }
}
