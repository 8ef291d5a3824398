use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{success, Success};
use crate::http::error::ApiError;
use crate::http::extract::{IdPath, JsonBody};
use crate::http::state::AppState;
use crate::results::{self, AgentResult, AggregateScope};
use crate::swarm::{self, SwarmOptions, SwarmResult};
use crate::templates::{ListKind, TemplateInfo};

/// POST /api/swarm/{template}
pub async fn run_swarm(
    State(state): State<Arc<AppState>>,
    IdPath(template): IdPath,
    JsonBody(opts): JsonBody<SwarmOptions>,
) -> Result<Json<Success<SwarmResult>>, ApiError> {
    let result = state
        .run(move |p| swarm::run_swarm(p, &template, opts))
        .await?;
    Ok(success(result))
}

#[derive(Serialize)]
pub struct ListResponse {
    pub kind: ListKind,
    pub items: Vec<TemplateInfo>,
}

/// GET /api/list/{kind}
pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<ListResponse>, ApiError> {
    let kind: ListKind = kind.parse()?;
    let items = state.run(move |p| p.templates().list(kind)).await?;
    Ok(Json(ListResponse { kind, items }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AggregateQuery {
    pub worktree: Option<String>,
}

#[derive(Serialize)]
pub struct AggregateResponse {
    pub results: Vec<AgentResult>,
}

/// GET /api/aggregate
pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<AggregateResponse>, ApiError> {
    let scope = match query.worktree {
        Some(id) => AggregateScope::Worktree(id),
        None => AggregateScope::All,
    };
    let results = state.run(move |p| results::aggregate(p, scope)).await?;
    Ok(Json(AggregateResponse { results }))
}
