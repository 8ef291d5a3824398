use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::storage::AppConfig;
use crate::templates::{ListKind, TemplateInfo};

const REDACTED: &str = "********";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub project_root: String,
    pub session_name: String,
    pub config: AppConfig,
}

/// GET /api/config
pub async fn show_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let project = &state.project;
    let mut config = project.config.clone();
    if config.api.token.is_some() {
        config.api.token = Some(REDACTED.to_string());
    }
    Json(ConfigResponse {
        project_root: project.root().display().to_string(),
        session_name: project.session_name().to_string(),
        config,
    })
}

#[derive(Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<TemplateInfo>,
}

/// GET /api/templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TemplatesResponse>, ApiError> {
    let templates = state
        .run(|p| p.templates().list(ListKind::Templates))
        .await?;
    Ok(Json(TemplatesResponse { templates }))
}
