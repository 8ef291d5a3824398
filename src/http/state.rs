use std::sync::Arc;

use crate::http::error::ApiError;
use crate::http::events::EventHub;
use crate::manifest::Manifest;
use crate::project::Project;

pub struct AppState {
    pub project: Arc<Project>,
    /// Required bearer token for `/api/*`; `None` leaves the API open.
    pub token: Option<String>,
    pub events: Arc<EventHub>,
}

impl AppState {
    /// Wires the project's manifest writes into the event hub.
    pub fn new(project: Arc<Project>, token: Option<String>) -> Self {
        let events = Arc::new(EventHub::new());
        let hub = Arc::clone(&events);
        project
            .store
            .observe(Arc::new(move |manifest: &Manifest| hub.publish_manifest(manifest)));
        Self {
            project,
            token,
            events,
        }
    }

    /// Run a blocking engine call on tokio's blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Project) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let project = Arc::clone(&self.project);
        tokio::task::spawn_blocking(move || f(&project))
            .await
            .map_err(|e| ApiError::internal(format!("engine task failed: {}", e)))?
            .map_err(ApiError::from)
    }
}
