//! Agent types, launching, and lifecycle supervision.

mod registry;
mod supervisor;
pub mod variant;

pub use registry::{shell_quote, with_exit_sentinel, AgentRegistry, AgentType, LaunchInput, LaunchPlan};
pub use supervisor::{
    kill, logs, refresh_all, refresh_status, restart, send, spawn, wait, KillOptions, KillResult,
    KillTarget, LogsResult, PromptSource, RestartOptions, SendRequest, SpawnRequest, SpawnResult,
    SpawnTarget, SpawnedAgent, WaitOptions, WaitScope, WaitedAgent,
};
