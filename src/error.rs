use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Stable error codes. Clients branch on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotGitRepo,
    TmuxNotFound,
    NotInitialized,
    ManifestLock,
    WorktreeNotFound,
    AgentNotFound,
    AgentsRunning,
    WaitTimeout,
    AgentsFailed,
    MergeFailed,
    InvalidArgs,
    UnmergedWork,
    PromptNotFound,
    InvalidManifest,
    CommandFailed,
    SpawnFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotGitRepo => "NOT_GIT_REPO",
            Self::TmuxNotFound => "TMUX_NOT_FOUND",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::ManifestLock => "MANIFEST_LOCK",
            Self::WorktreeNotFound => "WORKTREE_NOT_FOUND",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::AgentsRunning => "AGENTS_RUNNING",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::AgentsFailed => "AGENTS_FAILED",
            Self::MergeFailed => "MERGE_FAILED",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::UnmergedWork => "UNMERGED_WORK",
            Self::PromptNotFound => "PROMPT_NOT_FOUND",
            Self::InvalidManifest => "INVALID_MANIFEST",
            Self::CommandFailed => "COMMAND_FAILED",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PpgError {
    #[error("Not a git repository: {0}")]
    NotGitRepo(PathBuf),
    #[error("tmux is not installed or not on PATH")]
    TmuxNotFound,
    #[error("ppg is not initialized in {0}")]
    NotInitialized(PathBuf),
    #[error("Could not acquire manifest lock within {0:?}")]
    ManifestLock(Duration),
    #[error("Manifest schema version {found} is not supported (expected {expected})")]
    ManifestSchema { found: u32, expected: u32 },
    #[error("Manifest is not valid JSON: {0}")]
    ManifestParse(serde_json::Error),
    #[error("Worktree not found: {0}")]
    WorktreeNotFound(String),
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Agents still running in {scope}: {}", agents.join(", "))]
    AgentsRunning { scope: String, agents: Vec<String> },
    #[error("Timed out waiting for agents: {}", pending.join(", "))]
    WaitTimeout { pending: Vec<String> },
    #[error("Agents ended in failure: {}", failed.join(", "))]
    AgentsFailed { failed: Vec<String> },
    #[error("Merge of {branch} hit conflicts in: {}", files.join(", "))]
    MergeConflict { branch: String, files: Vec<String> },
    #[error("Merge failed: {0}")]
    MergeFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Refusing to reset: completed work not merged or linked to a PR in {}", worktrees.join(", "))]
    UnmergedWork { worktrees: Vec<String> },
    #[error("Prompt or template not found: {0}")]
    PromptNotFound(String),
    #[error("`{program} {args}` failed: {message}")]
    CommandFailed {
        program: String,
        args: String,
        message: String,
    },
    #[error("Failed to launch agent {agent}: {message}")]
    SpawnFailed { agent: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PpgError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotGitRepo(_) => ErrorCode::NotGitRepo,
            Self::TmuxNotFound => ErrorCode::TmuxNotFound,
            Self::NotInitialized(_) => ErrorCode::NotInitialized,
            Self::ManifestLock(_) => ErrorCode::ManifestLock,
            Self::ManifestSchema { .. } | Self::ManifestParse(_) => ErrorCode::InvalidManifest,
            Self::WorktreeNotFound(_) => ErrorCode::WorktreeNotFound,
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::AgentsRunning { .. } => ErrorCode::AgentsRunning,
            Self::WaitTimeout { .. } => ErrorCode::WaitTimeout,
            Self::AgentsFailed { .. } => ErrorCode::AgentsFailed,
            Self::MergeConflict { .. } | Self::MergeFailed(_) => ErrorCode::MergeFailed,
            Self::InvalidArgs(_) => ErrorCode::InvalidArgs,
            Self::UnmergedWork { .. } => ErrorCode::UnmergedWork,
            Self::PromptNotFound(_) => ErrorCode::PromptNotFound,
            Self::CommandFailed { .. } => ErrorCode::CommandFailed,
            Self::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            Self::Io(_) | Self::Json(_) => ErrorCode::Internal,
        }
    }

    /// Corrective command for errors the caller can fix, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotInitialized(_) => Some("run `ppg init` in the repository root"),
            Self::ManifestLock(_) => Some("another ppg command holds the lock; retry shortly"),
            Self::WorktreeNotFound(_) | Self::AgentNotFound(_) => Some("run `ppg status` to list ids"),
            Self::AgentsRunning { .. } => Some("wait for the agents, kill them, or pass --force"),
            Self::UnmergedWork { .. } => Some("merge the work, record a PR, or pass --force"),
            Self::MergeConflict { .. } => Some("resolve the conflicts by hand in the project root"),
            _ => None,
        }
    }

    /// Lock contention is the only transient class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ManifestLock(_))
    }
}

pub type Result<T> = std::result::Result<T, PpgError>;
