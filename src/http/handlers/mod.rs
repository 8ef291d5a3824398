pub mod agents;
pub mod health;
pub mod project;
pub mod swarms;
pub mod worktrees;

use axum::Json;
use serde::Serialize;

/// `{success: true, ...body}` for mutating routes.
#[derive(Serialize)]
pub struct Success<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
}

pub fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}
