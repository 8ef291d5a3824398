//! Terminal-multiplexer seam. Agents live in panes; everything else in the
//! crate talks to panes only through [`Multiplexer`].

mod tmux;

pub use tmux::TmuxController;

use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// A freshly created window and the pane it opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowRef {
    pub window: String,
    pub pane: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureScope {
    /// The last `n` lines of scrollback.
    Lines(usize),
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Send `text` verbatim instead of interpreting it as key names (`C-c`, `Escape`).
    pub literal: bool,
    pub append_enter: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            literal: true,
            append_enter: true,
        }
    }
}

pub trait Multiplexer: Send + Sync {
    /// Create the session unless it already exists.
    fn ensure_session(&self, name: &str, cwd: &Path) -> Result<()>;
    fn create_window(&self, session: &str, label: &str, cwd: &Path) -> Result<WindowRef>;
    /// Split a new pane off `window`.
    fn create_pane(&self, window: &str, cwd: &Path) -> Result<String>;
    fn capture(&self, pane: &str, scope: CaptureScope) -> Result<String>;
    fn send_keys(&self, pane: &str, text: &str, opts: SendOptions) -> Result<()>;
    /// False when the pane is gone or its process has died.
    fn is_alive(&self, pane: &str) -> Result<bool>;
    /// Idempotent: killing a missing pane is not an error.
    fn kill_pane(&self, pane: &str) -> Result<()>;
    fn kill_window(&self, window: &str) -> Result<()>;
    fn window_exists(&self, window: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::Multiplexer;
    use crate::agent::{spawn, SpawnRequest};
    use crate::testutil::{test_project, FakeMultiplexer};

    #[test]
    fn test_ensure_session_is_idempotent() {
        let mux = FakeMultiplexer::new();
        let cwd = std::env::temp_dir();
        mux.ensure_session("ppg-demo", &cwd).unwrap();
        mux.ensure_session("ppg-demo", &cwd).unwrap();
        assert_eq!(mux.session_count(), 1);
    }

    #[test]
    fn test_spawns_share_one_session() {
        let (_repo, project, mux) = test_project();
        spawn(&project, SpawnRequest::default()).unwrap();
        spawn(&project, SpawnRequest::default()).unwrap();
        assert_eq!(mux.session_count(), 1);
    }
}
