use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use crate::http::error::ApiError;
use crate::http::events;
use crate::http::state::AppState;
use crate::http::handlers::{agents, health, project, swarms, worktrees};

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/agents", get(agents::list_types))
        .route("/spawn", post(agents::spawn))
        .route("/status", get(worktrees::status))
        .route("/kill", post(agents::kill))
        .route("/wait", post(agents::wait))
        .route("/restart/{agent_id}", post(agents::restart))
        .route("/send/{agent_id}", post(agents::send))
        .route("/logs/{agent_id}", get(agents::logs))
        // Worktree routes
        .route("/merge/{id}", post(worktrees::merge))
        .route("/diff/{id}", get(worktrees::diff))
        .route("/pr/{id}", post(worktrees::set_pr))
        .route("/clean", post(worktrees::clean))
        .route("/reset", post(worktrees::reset))
        // Swarms, prompt material, results
        .route("/swarm/{template}", post(swarms::run_swarm))
        .route("/list/{kind}", get(swarms::list))
        .route("/aggregate", get(swarms::aggregate))
        // Resource-style aliases
        .route("/worktrees", get(worktrees::list).post(worktrees::create))
        .route("/worktrees/{id}/merge", post(worktrees::merge))
        .route("/worktrees/{id}/kill", post(worktrees::kill))
        .route("/agents/{agent_id}/logs", get(agents::logs))
        .route("/agents/{agent_id}/send", post(agents::send))
        .route("/agents/{agent_id}/kill", post(agents::kill_agent))
        .route("/agents/{agent_id}/restart", post(agents::restart))
        .route("/config", get(project::show_config))
        .route("/templates", get(project::list_templates))
        .route("/events", get(events::events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .layer(cors)
        .with_state(state)
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header, or `?token=` for WebSocket clients that cannot set headers.
async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.token {
        let header = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let presented = header.or_else(|| {
            Query::<TokenQuery>::try_from_uri(request.uri())
                .ok()
                .and_then(|Query(q)| q.token)
        });
        if !presented.map(|t| tokens_match(&t, expected)).unwrap_or(false) {
            return Err(ApiError::unauthorized());
        }
    }
    Ok(next.run(request).await)
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
