use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{success, Success};
use crate::agent::variant::{self, AgentVariant};
use crate::agent::{
    self, AgentType, KillOptions, KillResult, KillTarget, LogsResult, PromptSource, RestartOptions,
    SendRequest, SpawnRequest, SpawnResult, SpawnTarget, WaitOptions, WaitScope, WaitedAgent,
};
use crate::http::error::ApiError;
use crate::http::extract::{IdPath, JsonBody};
use crate::http::state::AppState;

/// Upper bound on a wait over HTTP when the caller gives none.
const DEFAULT_HTTP_WAIT: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnBody {
    pub name: Option<String>,
    pub agent: Option<String>,
    pub prompt: Option<String>,
    pub prompt_file: Option<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub base: Option<String>,
    pub worktree: Option<String>,
    pub count: Option<usize>,
    /// Run in the project root instead of a worktree.
    #[serde(default)]
    pub root: bool,
}

impl SpawnBody {
    fn into_request(self) -> Result<SpawnRequest, ApiError> {
        let prompt = match (self.prompt, self.prompt_file, self.template) {
            (None, None, None) => PromptSource::None,
            (Some(text), None, None) => PromptSource::Inline(text),
            (None, Some(path), None) => PromptSource::File(PathBuf::from(path)),
            (None, None, Some(name)) => PromptSource::Template(name),
            _ => {
                return Err(ApiError::bad_request(
                    "give at most one of prompt, promptFile, template",
                ))
            }
        };
        let target = match (self.worktree, self.root) {
            (Some(_), true) => {
                return Err(ApiError::bad_request("worktree and root are exclusive"));
            }
            (Some(wt), false) => SpawnTarget::Worktree(wt),
            (None, true) => SpawnTarget::ProjectRoot,
            (None, false) => SpawnTarget::NewWorktree {
                name: self.name.clone(),
                base: self.base,
            },
        };
        Ok(SpawnRequest {
            target,
            agent_type: self.agent,
            prompt,
            vars: self.vars,
            count: self.count.unwrap_or(1),
            name: self.name,
        })
    }
}

/// POST /api/spawn
pub async fn spawn(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<SpawnBody>,
) -> Result<Json<Success<SpawnResult>>, ApiError> {
    let req = body.into_request()?;
    let result = state.run(move |p| agent::spawn(p, req)).await?;
    Ok(success(result))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillBody {
    pub agent: Option<String>,
    pub worktree: Option<String>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub delete: bool,
}

/// POST /api/kill
pub async fn kill(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<KillBody>,
) -> Result<Json<Success<KillResult>>, ApiError> {
    let target = match (body.agent, body.worktree, body.all) {
        (Some(id), None, false) => KillTarget::Agent(id),
        (None, Some(id), false) => KillTarget::Worktree(id),
        (None, None, true) => KillTarget::All,
        _ => {
            return Err(ApiError::bad_request(
                "give exactly one of agent, worktree, all",
            ))
        }
    };
    let opts = KillOptions {
        remove: body.remove,
        delete: body.delete,
    };
    let result = state.run(move |p| agent::kill(p, target, opts)).await?;
    Ok(success(result))
}

/// POST /api/agents/{agent_id}/kill
pub async fn kill_agent(
    State(state): State<Arc<AppState>>,
    IdPath(agent_id): IdPath,
) -> Result<Json<Success<KillResult>>, ApiError> {
    let result = state
        .run(move |p| agent::kill(p, KillTarget::Agent(agent_id), KillOptions::default()))
        .await?;
    Ok(success(result))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitBody {
    pub worktree: Option<String>,
    pub agents: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub interval_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct WaitResponse {
    pub agents: Vec<WaitedAgent>,
}

/// POST /api/wait
pub async fn wait(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<WaitBody>,
) -> Result<Json<Success<WaitResponse>>, ApiError> {
    let scope = match (body.worktree, body.agents) {
        (Some(wt), None) => WaitScope::Worktree(wt),
        (None, Some(ids)) if !ids.is_empty() => WaitScope::Agents(ids),
        (None, None) => WaitScope::All,
        _ => return Err(ApiError::bad_request("give either worktree or agents")),
    };
    let mut opts = WaitOptions {
        timeout: Some(
            body.timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HTTP_WAIT),
        ),
        ..Default::default()
    };
    if let Some(secs) = body.interval_secs {
        opts.interval = Duration::from_secs(secs.max(1));
    }
    let agents = state.run(move |p| agent::wait(p, scope, opts)).await?;
    Ok(success(WaitResponse { agents }))
}

/// POST /api/restart/{agent_id}, /api/agents/{agent_id}/restart
pub async fn restart(
    State(state): State<Arc<AppState>>,
    IdPath(agent_id): IdPath,
    JsonBody(opts): JsonBody<RestartOptions>,
) -> Result<Json<Success<SpawnResult>>, ApiError> {
    let result = state
        .run(move |p| agent::restart(p, &agent_id, opts))
        .await?;
    Ok(success(result))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub agent_id: String,
}

/// POST /api/send/{agent_id}, /api/agents/{agent_id}/send
pub async fn send(
    State(state): State<Arc<AppState>>,
    IdPath(agent_id): IdPath,
    JsonBody(req): JsonBody<SendRequest>,
) -> Result<Json<Success<SendResponse>>, ApiError> {
    let agent_id = state
        .run(move |p| agent::send(p, &agent_id, &req).map(|_| agent_id))
        .await?;
    Ok(success(SendResponse { agent_id }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

/// GET /api/logs/{agent_id}, /api/agents/{agent_id}/logs
pub async fn logs(
    State(state): State<Arc<AppState>>,
    IdPath(agent_id): IdPath,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResult>, ApiError> {
    let result = state
        .run(move |p| agent::logs(p, &agent_id, query.lines))
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypesResponse {
    pub default_agent: String,
    pub types: Vec<AgentType>,
    /// Everything `/api/spawn` accepts as `agent`, including `worktree`.
    pub variants: &'static [AgentVariant],
}

/// GET /api/agents
pub async fn list_types(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AgentTypesResponse>, ApiError> {
    let registry = state.project.registry();
    Ok(Json(AgentTypesResponse {
        default_agent: registry.default_agent().to_string(),
        types: registry.list(),
        variants: variant::ALL,
    }))
}
