use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use super::{
    Cli, Command, CronCommand, KillArgs, MergeArgs, SpawnArgs, SwarmArgs, WaitArgs, WorktreeCommand,
};
use crate::agent::{
    self, KillOptions, KillTarget, PromptSource, RestartOptions, SendRequest, SpawnRequest,
    SpawnTarget, WaitOptions, WaitScope,
};
use crate::error::{PpgError, Result};
use crate::git::{DiffOptions, MergeStrategy};
use crate::http::{self, state::AppState};
use crate::project::Project;
use crate::results::{self, AggregateScope};
use crate::schedule;
use crate::session::TmuxController;
use crate::swarm::{self, SwarmOptions};
use crate::templates::ListKind;
use crate::worktree::{self, MergeOptions};

/// Execute one subcommand. `Ok(None)` means nothing to print.
pub fn run(cli: Cli) -> Result<Option<Value>> {
    match cli.command {
        Command::Init => {
            let project = Project::init(&cli.dir, Arc::new(TmuxController::new()?))?;
            Ok(Some(init_json(&project)))
        }
        command => {
            let project = Project::discover(&cli.dir)?;
            dispatch(project, command)
        }
    }
}

fn dispatch(project: Project, command: Command) -> Result<Option<Value>> {
    let value = match command {
        Command::Init => init_json(&Project::init(project.root(), project.mux.clone())?),
        Command::Spawn(args) => success(agent::spawn(&project, spawn_request(args)?)?)?,
        Command::Status { worktree } => status(&project, worktree)?,
        Command::Worktree {
            command: WorktreeCommand::Create { name, base },
        } => {
            let created = worktree::create(&project, &name, base.as_deref())?;
            json!({ "success": true, "worktree": created.entry })
        }
        Command::Kill(args) => kill(&project, args)?,
        Command::Merge(args) => merge(&project, args)?,
        Command::Diff {
            worktree,
            stat,
            name_only,
        } => to_json(worktree::diff(
            &project,
            &worktree,
            DiffOptions { stat, name_only },
        )?)?,
        Command::Aggregate { worktree } => {
            let scope = match worktree {
                Some(id) => AggregateScope::Worktree(id),
                None => AggregateScope::All,
            };
            json!({ "results": results::aggregate(&project, scope)? })
        }
        Command::Wait(args) => wait(&project, args)?,
        Command::Restart {
            agent,
            prompt,
            agent_type,
        } => success(agent::restart(
            &project,
            &agent,
            RestartOptions { prompt, agent_type },
        )?)?,
        Command::Send {
            agent,
            text,
            keys,
            no_enter,
        } => {
            let req = SendRequest {
                text,
                keys,
                append_enter: !no_enter,
            };
            agent::send(&project, &agent, &req)?;
            json!({ "success": true, "agentId": agent })
        }
        Command::Logs { agent, lines } => to_json(agent::logs(&project, &agent, lines)?)?,
        Command::Swarm(args) => swarm(&project, args)?,
        Command::List { kind } => {
            let kind: ListKind = kind.parse()?;
            json!({ "kind": kind, "items": project.templates().list(kind)? })
        }
        Command::Clean { include_failed } => {
            json!({ "success": true, "cleaned": worktree::clean(&project, include_failed)? })
        }
        Command::Reset { force } => success(worktree::reset(&project, force)?)?,
        Command::Pr { worktree, url } => {
            json!({ "success": true, "worktree": worktree::set_pr_url(&project, &worktree, &url)? })
        }
        Command::Agents => {
            let registry = project.registry();
            json!({
                "defaultAgent": registry.default_agent(),
                "types": registry.list(),
                "variants": agent::variant::ALL,
            })
        }
        Command::Serve { port, token } => {
            serve(project, port, token)?;
            return Ok(None);
        }
        Command::Cron { command } => return cron(project, command),
    };
    Ok(Some(value))
}

fn init_json(project: &Project) -> Value {
    json!({
        "success": true,
        "root": project.root(),
        "sessionName": project.session_name(),
    })
}

fn spawn_request(args: SpawnArgs) -> Result<SpawnRequest> {
    let prompt = if let Some(text) = args.prompt {
        PromptSource::Inline(text)
    } else if let Some(path) = args.prompt_file {
        PromptSource::File(path)
    } else if let Some(name) = args.template {
        PromptSource::Template(name)
    } else if let Some(name) = args.prompt_name {
        PromptSource::Named(name)
    } else {
        PromptSource::None
    };
    let target = match (args.worktree, args.root) {
        (Some(wt), _) => SpawnTarget::Worktree(wt),
        (None, true) => SpawnTarget::ProjectRoot,
        (None, false) => SpawnTarget::NewWorktree {
            name: args.name.clone(),
            base: args.base,
        },
    };
    Ok(SpawnRequest {
        target,
        agent_type: args.agent,
        prompt,
        vars: args.vars.into_iter().collect(),
        count: args.count,
        name: args.name,
    })
}

fn status(project: &Project, worktree: Option<String>) -> Result<Value> {
    let manifest = agent::refresh_all(project)?;
    Ok(match worktree {
        Some(id) => {
            let wt = manifest.resolve_worktree(&id)?;
            let mut worktrees = serde_json::Map::new();
            worktrees.insert(wt.id.clone(), to_json(wt)?);
            json!({
                "session": manifest.session_name,
                "worktrees": worktrees,
                "agents": {},
            })
        }
        None => json!({
            "session": manifest.session_name,
            "worktrees": manifest.worktrees,
            "agents": manifest.agents,
        }),
    })
}

fn kill(project: &Project, args: KillArgs) -> Result<Value> {
    let target = match (args.target.agent, args.target.worktree, args.target.all) {
        (Some(id), _, _) => KillTarget::Agent(id),
        (None, Some(id), _) => KillTarget::Worktree(id),
        (None, None, true) => KillTarget::All,
        (None, None, false) => {
            return Err(PpgError::InvalidArgs(
                "give one of --agent, --worktree, --all".to_string(),
            ))
        }
    };
    let opts = KillOptions {
        remove: args.remove,
        delete: args.delete,
    };
    success(agent::kill(project, target, opts)?)
}

fn merge(project: &Project, args: MergeArgs) -> Result<Value> {
    let strategy: MergeStrategy = args.strategy.parse()?;
    let opts = MergeOptions {
        strategy,
        cleanup: args.cleanup,
        force: args.force,
        dry_run: args.dry_run,
    };
    success(worktree::merge(project, &args.worktree, opts)?)
}

fn wait(project: &Project, args: WaitArgs) -> Result<Value> {
    let scope = match args.worktree {
        Some(wt) => WaitScope::Worktree(wt),
        None if !args.agent.is_empty() => WaitScope::Agents(args.agent),
        None => WaitScope::All,
    };
    let opts = WaitOptions {
        timeout: args.timeout.map(Duration::from_secs),
        interval: Duration::from_secs(args.interval.max(1)),
    };
    let agents = agent::wait(project, scope, opts)?;
    Ok(json!({ "success": true, "agents": agents }))
}

fn swarm(project: &Project, args: SwarmArgs) -> Result<Value> {
    let opts = SwarmOptions {
        worktree: args.worktree,
        vars: args.vars.into_iter().collect::<HashMap<_, _>>(),
        name: args.worktree_name,
        base: args.base,
    };
    success(swarm::run_swarm(project, &args.name, opts)?)
}

fn serve(project: Project, port: Option<u16>, token: Option<String>) -> Result<()> {
    let port = port.unwrap_or(project.config.api.port);
    let token = token.or_else(|| project.config.api.token.clone());
    if token.is_none() {
        tracing::warn!("HTTP API has no token; anything on localhost can drive it");
    }
    let state = Arc::new(AppState::new(Arc::new(project), token));
    runtime()?.block_on(http::serve(state, port))?;
    Ok(())
}

fn cron(project: Project, command: CronCommand) -> Result<Option<Value>> {
    let value = match command {
        CronCommand::Start => {
            let exe = std::env::current_exe()?;
            let pid = schedule::start_daemon(&project.paths, &exe)?;
            json!({ "success": true, "pid": pid })
        }
        CronCommand::Stop => {
            let pid = schedule::stop_daemon(&project.paths)?;
            json!({ "success": true, "stopped": pid.is_some(), "pid": pid })
        }
        CronCommand::Status => to_json(schedule::daemon_status(&project.paths))?,
        CronCommand::List => {
            let entries = schedule::load_schedules(&project.paths)?;
            let schedules: Vec<Value> = entries
                .iter()
                .map(|e| {
                    let mut v = serde_json::to_value(e)?;
                    v["nextRun"] = json!(e.next_run());
                    Ok(v)
                })
                .collect::<Result<_>>()?;
            json!({ "schedules": schedules })
        }
        CronCommand::Daemon => {
            runtime()?.block_on(schedule::run_daemon(Arc::new(project)))?;
            return Ok(None);
        }
    };
    Ok(Some(value))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn to_json<T: Serialize>(body: T) -> Result<Value> {
    Ok(serde_json::to_value(body)?)
}

/// Serialize `body` and mark it `success: true`.
fn success<T: Serialize>(body: T) -> Result<Value> {
    let mut value = to_json(body)?;
    if let Value::Object(map) = &mut value {
        map.insert("success".to_string(), Value::Bool(true));
    }
    Ok(value)
}

/// `{error: {code, message, hint?}}` on stdout, for callers parsing JSON.
pub fn print_error(err: &PpgError) {
    let mut error = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(hint) = err.hint() {
        error["hint"] = json!(hint);
    }
    println!("{}", json!({ "error": error }));
}
