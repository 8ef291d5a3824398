//! `/api/events`: manifest and agent-status pushes plus terminal streaming.
//!
//! Every manifest write lands in the [`EventHub`] through a store observer;
//! a background watcher refreshes agent status while clients are connected
//! so pane deaths show up without anyone writing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{self, SendRequest};
use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::manifest::{AgentEntry, AgentStatus, Manifest, WorktreeStatus};

const EVENT_CAPACITY: usize = 256;
const WATCH_INTERVAL: Duration = Duration::from_secs(2);
const TERMINAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "manifest:updated")]
    ManifestUpdated { manifest: Manifest },
    #[serde(rename = "agent:status", rename_all = "camelCase")]
    AgentStatusChanged {
        worktree_id: Option<String>,
        agent_id: String,
        status: AgentStatus,
        worktree_status: Option<WorktreeStatus>,
    },
    #[serde(rename = "terminal:output", rename_all = "camelCase")]
    TerminalOutput { agent_id: String, data: String },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl From<ApiError> for ServerEvent {
    fn from(err: ApiError) -> Self {
        ServerEvent::Error {
            code: err.code.to_string(),
            message: err.message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "terminal:subscribe", rename_all = "camelCase")]
    Subscribe { agent_id: String },
    #[serde(rename = "terminal:unsubscribe", rename_all = "camelCase")]
    Unsubscribe { agent_id: String },
    #[serde(rename = "terminal:input", rename_all = "camelCase")]
    Input { agent_id: String, data: String },
}

/// Fan-out point for server events.
pub struct EventHub {
    tx: broadcast::Sender<ServerEvent>,
    last: Mutex<Option<Manifest>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn has_listeners(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Publish `manifest` unless an equal or newer one already went out.
    ///
    /// One `agent:status` per changed agent goes out before the snapshot.
    pub fn publish_manifest(&self, manifest: &Manifest) {
        let events = {
            let mut last = self.last.lock();
            let events = match last.as_ref() {
                Some(prev) if prev.updated_at >= manifest.updated_at => return,
                Some(prev) => status_changes(prev, manifest),
                None => Vec::new(),
            };
            *last = Some(manifest.clone());
            events
        };
        // Nobody listening is not an error.
        for event in events {
            let _ = self.tx.send(event);
        }
        let _ = self.tx.send(ServerEvent::ManifestUpdated {
            manifest: manifest.clone(),
        });
    }
}

fn located_agents(m: &Manifest) -> impl Iterator<Item = (Option<(&str, WorktreeStatus)>, &AgentEntry)> {
    m.agents.values().map(|a| (None, a)).chain(m.worktrees.values().flat_map(|wt| {
        wt.agents
            .values()
            .map(move |a| (Some((wt.id.as_str(), wt.status)), a))
    }))
}

fn status_changes(prev: &Manifest, next: &Manifest) -> Vec<ServerEvent> {
    let before: HashMap<&str, AgentStatus> = located_agents(prev)
        .map(|(_, a)| (a.id.as_str(), a.status))
        .collect();
    located_agents(next)
        .filter(|(_, a)| before.get(a.id.as_str()) != Some(&a.status))
        .map(|(wt, a)| ServerEvent::AgentStatusChanged {
            worktree_id: wt.map(|(id, _)| id.to_string()),
            agent_id: a.id.clone(),
            status: a.status,
            worktree_status: wt.map(|(_, status)| status),
        })
        .collect()
}

/// Refresh agent status on a timer while anyone is connected.
pub async fn watch_manifest(state: Arc<AppState>) {
    let mut tick = tokio::time::interval(WATCH_INTERVAL);
    loop {
        tick.tick().await;
        if !state.events.has_listeners() {
            continue;
        }
        match state.run(agent::refresh_all).await {
            Ok(manifest) => state.events.publish_manifest(&manifest),
            Err(e) => tracing::debug!("Manifest watch skipped a round: {}", e.message),
        }
    }
}

/// GET /api/events
pub async fn events(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Could not encode event: {}", e);
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.events.subscribe();
    let first = match state.run(|p| p.manifest()).await {
        Ok(manifest) => ServerEvent::ManifestUpdated { manifest },
        Err(e) => e.into(),
    };
    if send_event(&mut socket, &first).await.is_err() {
        return;
    }
    tracing::debug!("Event client connected");

    // Agent id -> last output sent.
    let mut terminals: HashMap<String, String> = HashMap::new();
    let mut tick = tokio::time::interval(TERMINAL_INTERVAL);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = handle_command(&state, &mut terminals, text.as_str()).await;
                if let Some(event) = reply {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event client lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick.tick(), if !terminals.is_empty() => {
                let mut outgoing = Vec::new();
                let mut gone = Vec::new();
                for (agent_id, last) in terminals.iter_mut() {
                    let id = agent_id.clone();
                    match state.run(move |p| agent::logs(p, &id, None)).await {
                        Ok(logs) if logs.output != *last => {
                            *last = logs.output.clone();
                            outgoing.push(ServerEvent::TerminalOutput {
                                agent_id: agent_id.clone(),
                                data: logs.output,
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            gone.push(agent_id.clone());
                            outgoing.push(e.into());
                        }
                    }
                }
                for id in gone {
                    terminals.remove(&id);
                }
                let mut closed = false;
                for event in &outgoing {
                    if send_event(&mut socket, event).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }
    tracing::debug!("Event client disconnected");
}

async fn handle_command(
    state: &Arc<AppState>,
    terminals: &mut HashMap<String, String>,
    text: &str,
) -> Option<ServerEvent> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => return Some(ApiError::bad_request(format!("invalid command: {}", e)).into()),
    };
    match command {
        ClientCommand::Ping => Some(ServerEvent::Pong),
        ClientCommand::Subscribe { agent_id } => {
            terminals.entry(agent_id).or_default();
            None
        }
        ClientCommand::Unsubscribe { agent_id } => {
            terminals.remove(&agent_id);
            None
        }
        ClientCommand::Input { agent_id, data } => {
            let req = SendRequest {
                text: data,
                keys: false,
                append_enter: false,
            };
            state
                .run(move |p| agent::send(p, &agent_id, &req))
                .await
                .err()
                .map(ServerEvent::from)
        }
    }
}
