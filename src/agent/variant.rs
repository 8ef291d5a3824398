//! Built-in agent types and their display metadata.

use serde::Serialize;

use crate::storage::{AgentTypeConfig, PromptDelivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    /// An AI coding CLI that takes a prompt and eventually exits.
    Agent,
    /// A bare shell; the prompt, if any, is typed in as a command.
    Terminal,
    /// No pane at all: a worktree and its window, left empty.
    Worktree,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentVariant {
    pub id: &'static str,
    pub display_name: &'static str,
    pub subtitle: &'static str,
    pub command: &'static str,
    pub auto_approve_flag: Option<&'static str>,
    pub session_id_flag: Option<&'static str>,
    pub prompt_delivery: PromptDelivery,
    pub kind: VariantKind,
}

pub const CLAUDE: AgentVariant = AgentVariant {
    id: "claude",
    display_name: "Claude",
    subtitle: "AI coding agent",
    command: "claude",
    auto_approve_flag: Some("--dangerously-skip-permissions"),
    session_id_flag: Some("--session-id"),
    prompt_delivery: PromptDelivery::Arg,
    kind: VariantKind::Agent,
};

pub const CODEX: AgentVariant = AgentVariant {
    id: "codex",
    display_name: "Codex",
    subtitle: "OpenAI coding CLI",
    command: "codex",
    auto_approve_flag: Some("--full-auto"),
    session_id_flag: None,
    prompt_delivery: PromptDelivery::Arg,
    kind: VariantKind::Agent,
};

pub const OPENCODE: AgentVariant = AgentVariant {
    id: "opencode",
    display_name: "OpenCode",
    subtitle: "Open-source agent",
    command: "opencode",
    auto_approve_flag: None,
    session_id_flag: None,
    prompt_delivery: PromptDelivery::Keys,
    kind: VariantKind::Agent,
};

pub const TERMINAL: AgentVariant = AgentVariant {
    id: "terminal",
    display_name: "Terminal",
    subtitle: "Shell session",
    command: "",
    auto_approve_flag: None,
    session_id_flag: None,
    prompt_delivery: PromptDelivery::Keys,
    kind: VariantKind::Terminal,
};

/// Fallback for agent types that are neither built in nor configured: the
/// type name itself is run as the command with the prompt as an argument.
pub const CUSTOM: AgentVariant = AgentVariant {
    id: "custom",
    display_name: "Custom",
    subtitle: "User-defined command",
    command: "",
    auto_approve_flag: None,
    session_id_flag: None,
    prompt_delivery: PromptDelivery::Arg,
    kind: VariantKind::Agent,
};

/// Picking this type creates a worktree with no agent in it.
pub const WORKTREE: AgentVariant = AgentVariant {
    id: "worktree",
    display_name: "Worktree",
    subtitle: "Git worktree",
    command: "",
    auto_approve_flag: None,
    session_id_flag: None,
    prompt_delivery: PromptDelivery::Arg,
    kind: VariantKind::Worktree,
};

/// Types that run in a pane.
pub const BUILTIN: &[AgentVariant] = &[CLAUDE, CODEX, OPENCODE, TERMINAL];

/// Everything a client can offer, pane types first.
pub const ALL: &[AgentVariant] = &[CLAUDE, CODEX, OPENCODE, TERMINAL, WORKTREE];

pub fn lookup(id: &str) -> Option<&'static AgentVariant> {
    BUILTIN.iter().find(|v| v.id == id)
}

impl AgentVariant {
    /// The config entry `init` writes for this variant. Terminals and bare
    /// worktrees have no command to configure.
    pub fn default_config(&self) -> Option<AgentTypeConfig> {
        if self.kind != VariantKind::Agent {
            return None;
        }
        Some(AgentTypeConfig {
            command: self.command.to_string(),
            prompt_delivery: self.prompt_delivery,
            prompt_flag: None,
            auto_approve_flag: self.auto_approve_flag.map(String::from),
            session_id_flag: self.session_id_flag.map(String::from),
            env: None,
        })
    }
}
