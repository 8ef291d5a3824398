pub mod error;
pub mod events;
pub mod extract;
pub mod handlers;
pub mod routes;
pub mod state;

use crate::http::routes::create_router;
use crate::http::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serve the API on localhost until SIGINT/SIGTERM.
pub async fn serve(state: Arc<AppState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);
    let watcher = tokio::spawn(events::watch_manifest(state));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(crate::schedule::shutdown_signal())
        .await;
    watcher.abort();
    served
}
