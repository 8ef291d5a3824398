use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{success, Success};
use crate::agent::{self, KillOptions, KillResult, KillTarget};
use crate::git::{DiffOptions, MergeStrategy};
use crate::http::error::ApiError;
use crate::http::extract::{IdPath, JsonBody};
use crate::http::state::AppState;
use crate::manifest::{AgentEntry, WorktreeEntry};
use crate::worktree::{self, CleanedWorktree, DiffResult, MergeOptions, MergeResult, ResetResult};

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub worktree: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub session: String,
    pub worktrees: BTreeMap<String, WorktreeEntry>,
    /// Agents running in the project root.
    pub agents: BTreeMap<String, AgentEntry>,
}

/// GET /api/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let response = state
        .run(move |p| {
            let manifest = agent::refresh_all(p)?;
            let response = match query.worktree {
                Some(id) => {
                    let wt = manifest.resolve_worktree(&id)?.clone();
                    StatusResponse {
                        session: manifest.session_name.clone(),
                        worktrees: BTreeMap::from([(wt.id.clone(), wt)]),
                        agents: BTreeMap::new(),
                    }
                }
                None => StatusResponse {
                    session: manifest.session_name,
                    worktrees: manifest.worktrees,
                    agents: manifest.agents,
                },
            };
            Ok(response)
        })
        .await?;
    Ok(Json(response))
}

#[derive(Serialize)]
pub struct WorktreeListResponse {
    pub worktrees: Vec<WorktreeEntry>,
}

/// GET /api/worktrees
pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<WorktreeListResponse>, ApiError> {
    let manifest = state.run(agent::refresh_all).await?;
    Ok(Json(WorktreeListResponse {
        worktrees: manifest.worktrees.into_values().collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub base: Option<String>,
}

#[derive(Serialize)]
pub struct CreateResponse {
    pub worktree: WorktreeEntry,
}

/// POST /api/worktrees
pub async fn create(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<CreateBody>,
) -> Result<Json<Success<CreateResponse>>, ApiError> {
    let created = state
        .run(move |p| worktree::create(p, &body.name, body.base.as_deref()))
        .await?;
    Ok(success(CreateResponse {
        worktree: created.entry,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct WorktreeKillBody {
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub delete: bool,
}

/// POST /api/worktrees/{id}/kill
pub async fn kill(
    State(state): State<Arc<AppState>>,
    IdPath(id): IdPath,
    JsonBody(body): JsonBody<WorktreeKillBody>,
) -> Result<Json<Success<KillResult>>, ApiError> {
    let opts = KillOptions {
        remove: body.remove,
        delete: body.delete,
    };
    let result = state
        .run(move |p| agent::kill(p, KillTarget::Worktree(id), opts))
        .await?;
    Ok(success(result))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeBody {
    pub strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /api/merge/{id}, /api/worktrees/{id}/merge
pub async fn merge(
    State(state): State<Arc<AppState>>,
    IdPath(id): IdPath,
    JsonBody(body): JsonBody<MergeBody>,
) -> Result<Json<Success<MergeResult>>, ApiError> {
    let opts = MergeOptions {
        strategy: body.strategy.unwrap_or_default(),
        cleanup: body.cleanup,
        force: body.force,
        dry_run: body.dry_run,
    };
    let result = state.run(move |p| worktree::merge(p, &id, opts)).await?;
    Ok(success(result))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffQuery {
    #[serde(default)]
    pub stat: bool,
    #[serde(default)]
    pub name_only: bool,
}

/// GET /api/diff/{id}
pub async fn diff(
    State(state): State<Arc<AppState>>,
    IdPath(id): IdPath,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffResult>, ApiError> {
    let opts = DiffOptions {
        stat: query.stat,
        name_only: query.name_only,
    };
    let result = state.run(move |p| worktree::diff(p, &id, opts)).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct PrBody {
    pub url: String,
}

#[derive(Serialize)]
pub struct PrResponse {
    pub worktree: WorktreeEntry,
}

/// POST /api/pr/{id}
pub async fn set_pr(
    State(state): State<Arc<AppState>>,
    IdPath(id): IdPath,
    JsonBody(body): JsonBody<PrBody>,
) -> Result<Json<Success<PrResponse>>, ApiError> {
    if body.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }
    let worktree = state
        .run(move |p| worktree::set_pr_url(p, &id, body.url.trim()))
        .await?;
    Ok(success(PrResponse { worktree }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanBody {
    #[serde(default)]
    pub include_failed: bool,
}

#[derive(Serialize)]
pub struct CleanResponse {
    pub cleaned: Vec<CleanedWorktree>,
}

/// POST /api/clean
pub async fn clean(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<CleanBody>,
) -> Result<Json<Success<CleanResponse>>, ApiError> {
    let cleaned = state
        .run(move |p| worktree::clean(p, body.include_failed))
        .await?;
    Ok(success(CleanResponse { cleaned }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetBody {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/reset
pub async fn reset(
    State(state): State<Arc<AppState>>,
    JsonBody(body): JsonBody<ResetBody>,
) -> Result<Json<Success<ResetResult>>, ApiError> {
    let result = state.run(move |p| worktree::reset(p, body.force)).await?;
    Ok(success(result))
}
