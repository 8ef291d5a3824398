use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::{ErrorCode, PpgError};

pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidArgs.as_str(), message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing or invalid bearer token")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal.as_str(), message)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgs | ErrorCode::InvalidManifest => StatusCode::BAD_REQUEST,
        ErrorCode::WorktreeNotFound | ErrorCode::AgentNotFound | ErrorCode::PromptNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::AgentsRunning
        | ErrorCode::UnmergedWork
        | ErrorCode::MergeFailed
        | ErrorCode::NotInitialized
        | ErrorCode::NotGitRepo => StatusCode::CONFLICT,
        ErrorCode::AgentsFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::WaitTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::ManifestLock => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::TmuxNotFound
        | ErrorCode::CommandFailed
        | ErrorCode::SpawnFailed
        | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PpgError> for ApiError {
    fn from(err: PpgError) -> Self {
        let code = err.code();
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!("API request failed: {}", err);
        }
        let message = match err.hint() {
            Some(hint) => format!("{} ({})", err, hint),
            None => err.to_string(),
        };
        Self::new(status, code.as_str(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}
