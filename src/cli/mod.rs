//! Command-line surface. Every subcommand prints one JSON document on stdout.

mod commands;

pub use commands::{run, print_error};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// ppg - run coding agents in parallel git worktrees under tmux
#[derive(Parser, Debug)]
#[command(name = "ppg")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory inside the project repository
    #[arg(short = 'C', long, global = true, default_value = ".")]
    pub dir: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create .ppg/, the default config and an empty manifest
    Init,

    /// Start agents in a new or existing worktree
    Spawn(SpawnArgs),

    /// Show worktrees and agents with refreshed statuses
    Status {
        /// Only this worktree (id or name)
        #[arg(long)]
        worktree: Option<String>,
    },

    /// Manage worktrees without starting agents
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommand,
    },

    /// Kill agents, optionally removing their worktrees
    Kill(KillArgs),

    /// Merge a worktree's branch into its base branch
    Merge(MergeArgs),

    /// Show a worktree's changes against its base branch
    Diff {
        worktree: String,
        #[arg(long)]
        stat: bool,
        #[arg(long)]
        name_only: bool,
    },

    /// Collect results of finished agents
    Aggregate {
        #[arg(long)]
        worktree: Option<String>,
    },

    /// Block until agents finish or wait for input
    Wait(WaitArgs),

    /// Re-run a finished agent
    Restart {
        agent: String,
        /// Replacement prompt
        #[arg(long)]
        prompt: Option<String>,
        /// Replacement agent type
        #[arg(long)]
        agent_type: Option<String>,
    },

    /// Type text into an agent's pane
    Send {
        agent: String,
        text: String,
        /// Treat text as tmux key names (C-c, Escape)
        #[arg(long)]
        keys: bool,
        /// Do not press Enter afterwards
        #[arg(long)]
        no_enter: bool,
    },

    /// Print an agent's recent pane output
    Logs {
        agent: String,
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Run a swarm definition from .ppg/swarms/
    Swarm(SwarmArgs),

    /// List templates, prompts or swarms
    List {
        /// templates | prompts | swarms
        kind: String,
    },

    /// Drop merged and cleaned worktrees
    Clean {
        /// Also drop failed worktrees
        #[arg(long)]
        include_failed: bool,
    },

    /// Kill everything and tear down every worktree
    Reset {
        #[arg(long)]
        force: bool,
    },

    /// Record a pull request URL on a worktree
    Pr { worktree: String, url: String },

    /// List agent types and the default
    Agents,

    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Bearer token required on /api routes
        #[arg(long, env = "PPG_API_TOKEN")]
        token: Option<String>,
    },

    /// Manage the schedule daemon
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Args, Debug)]
pub struct SpawnArgs {
    /// New worktree name; also used as the agent label
    #[arg(long)]
    pub name: Option<String>,
    /// Agent type (default from config)
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long, group = "prompt_source")]
    pub prompt: Option<String>,
    #[arg(long, group = "prompt_source")]
    pub prompt_file: Option<PathBuf>,
    /// Template in .ppg/templates/
    #[arg(long, group = "prompt_source")]
    pub template: Option<String>,
    /// Prompt in .ppg/prompts/
    #[arg(long, group = "prompt_source")]
    pub prompt_name: Option<String>,
    /// Template variable, KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
    /// Base branch for a new worktree
    #[arg(long)]
    pub base: Option<String>,
    /// Existing worktree (id or name)
    #[arg(long, conflicts_with_all = ["root", "base"])]
    pub worktree: Option<String>,
    /// Run in the project root instead of a worktree
    #[arg(long, conflicts_with = "base")]
    pub root: bool,
    #[arg(long, default_value_t = 1)]
    pub count: usize,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false, id = "kill_target")]
pub struct KillTargetArgs {
    #[arg(long)]
    pub agent: Option<String>,
    #[arg(long)]
    pub worktree: Option<String>,
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct KillArgs {
    #[command(flatten)]
    pub target: KillTargetArgs,
    /// Tear down the worktrees in scope
    #[arg(long)]
    pub remove: bool,
    /// Drop the entries from the manifest
    #[arg(long)]
    pub delete: bool,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    pub worktree: String,
    /// squash | no-ff
    #[arg(long, default_value = "squash")]
    pub strategy: String,
    /// Remove the worktree, window and branch afterwards
    #[arg(long)]
    pub cleanup: bool,
    /// Merge even with agents still running
    #[arg(long)]
    pub force: bool,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    #[arg(long, conflicts_with = "agent")]
    pub worktree: Option<String>,
    /// Agent id (repeatable)
    #[arg(long)]
    pub agent: Vec<String>,
    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Seconds between polls
    #[arg(long, default_value_t = 5)]
    pub interval: u64,
}

#[derive(Args, Debug)]
pub struct SwarmArgs {
    pub name: String,
    /// Run a shared swarm in this existing worktree
    #[arg(long)]
    pub worktree: Option<String>,
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
    /// Worktree name (prefix for isolated swarms)
    #[arg(long = "worktree-name")]
    pub worktree_name: Option<String>,
    #[arg(long)]
    pub base: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum WorktreeCommand {
    /// Create an empty worktree with its own tmux window
    Create {
        name: String,
        /// Base branch (default: the current branch)
        #[arg(long)]
        base: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Show schedules and their next run
    List,
    /// Run the daemon in the foreground
    Daemon,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("issue=42=x").unwrap(),
            ("issue".to_string(), "42=x".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=v").is_err());
    }

    #[test]
    fn test_spawn_args_parse() {
        let cli = Cli::try_parse_from([
            "ppg", "spawn", "--name", "fix", "--prompt", "go", "--var", "a=1", "--count", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Spawn(args) => {
                assert_eq!(args.name.as_deref(), Some("fix"));
                assert_eq!(args.count, 2);
                assert_eq!(args.vars, vec![("a".to_string(), "1".to_string())]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prompt_sources_are_exclusive() {
        let err = Cli::try_parse_from(["ppg", "spawn", "--prompt", "a", "--template", "b"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_kill_needs_exactly_one_target() {
        assert!(Cli::try_parse_from(["ppg", "kill"]).is_err());
        assert!(Cli::try_parse_from(["ppg", "kill", "--all", "--agent", "ag-1"]).is_err());
        assert!(Cli::try_parse_from(["ppg", "kill", "--all", "--remove"]).is_ok());
    }

    #[test]
    fn test_worktree_create_args() {
        let cli = Cli::try_parse_from(["ppg", "worktree", "create", "auth", "--base", "dev"]).unwrap();
        match cli.command {
            Command::Worktree {
                command: WorktreeCommand::Create { name, base },
            } => {
                assert_eq!(name, "auth");
                assert_eq!(base.as_deref(), Some("dev"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["ppg", "worktree", "create"]).is_err());
    }
}
