//! Fixtures shared by unit tests: a scriptable multiplexer and throwaway git repos.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::error::{PpgError, Result};
use crate::project::Project;
use crate::session::{CaptureScope, Multiplexer, SendOptions, WindowRef};

#[derive(Debug, Clone)]
pub struct FakePane {
    pub window: String,
    pub cwd: PathBuf,
    pub alive: bool,
    pub sent: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    sessions: HashSet<String>,
    windows: BTreeMap<String, Vec<String>>,
    panes: HashMap<String, FakePane>,
    next_id: u32,
}

/// In-memory stand-in for tmux. Panes stay alive until killed or marked dead.
#[derive(Default)]
pub struct FakeMultiplexer {
    state: Mutex<FakeState>,
    fail_windows: AtomicBool,
    fail_sends: AtomicBool,
}

impl FakeMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_window_creation(&self, fail: bool) {
        self.fail_windows.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send_keys(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn pane(&self, pane: &str) -> Option<FakePane> {
        self.state.lock().panes.get(pane).cloned()
    }

    pub fn sent(&self, pane: &str) -> Vec<String> {
        self.pane(pane).map(|p| p.sent).unwrap_or_default()
    }

    /// Simulate the pane's process dying without ppg's involvement.
    pub fn set_dead(&self, pane: &str) {
        if let Some(p) = self.state.lock().panes.get_mut(pane) {
            p.alive = false;
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn live_panes(&self) -> usize {
        self.state.lock().panes.values().filter(|p| p.alive).count()
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().windows.len()
    }
}

impl Multiplexer for FakeMultiplexer {
    fn ensure_session(&self, name: &str, _cwd: &Path) -> Result<()> {
        self.state.lock().sessions.insert(name.to_string());
        Ok(())
    }

    fn create_window(&self, session: &str, label: &str, cwd: &Path) -> Result<WindowRef> {
        if self.fail_windows.load(Ordering::SeqCst) {
            return Err(PpgError::CommandFailed {
                program: "tmux".to_string(),
                args: format!("new-window -n {}", label),
                message: "simulated failure".to_string(),
            });
        }
        let mut state = self.state.lock();
        if !state.sessions.contains(session) {
            return Err(PpgError::CommandFailed {
                program: "tmux".to_string(),
                args: "new-window".to_string(),
                message: format!("can't find session: {}", session),
            });
        }
        state.next_id += 1;
        let window = format!("@{}", state.next_id);
        state.next_id += 1;
        let pane = format!("%{}", state.next_id);
        state.windows.insert(window.clone(), vec![pane.clone()]);
        state.panes.insert(
            pane.clone(),
            FakePane {
                window: window.clone(),
                cwd: cwd.to_path_buf(),
                alive: true,
                sent: Vec::new(),
            },
        );
        Ok(WindowRef { window, pane })
    }

    fn create_pane(&self, window: &str, cwd: &Path) -> Result<String> {
        let mut state = self.state.lock();
        if !state.windows.contains_key(window) {
            return Err(PpgError::CommandFailed {
                program: "tmux".to_string(),
                args: "split-window".to_string(),
                message: format!("can't find window: {}", window),
            });
        }
        state.next_id += 1;
        let pane = format!("%{}", state.next_id);
        if let Some(panes) = state.windows.get_mut(window) {
            panes.push(pane.clone());
        }
        state.panes.insert(
            pane.clone(),
            FakePane {
                window: window.to_string(),
                cwd: cwd.to_path_buf(),
                alive: true,
                sent: Vec::new(),
            },
        );
        Ok(pane)
    }

    fn capture(&self, pane: &str, scope: CaptureScope) -> Result<String> {
        let sent = self.sent(pane);
        let lines: Vec<String> = match scope {
            CaptureScope::Full => sent,
            CaptureScope::Lines(n) => sent.iter().rev().take(n).rev().cloned().collect(),
        };
        Ok(lines.join("\n"))
    }

    fn send_keys(&self, pane: &str, text: &str, _opts: SendOptions) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PpgError::CommandFailed {
                program: "tmux".to_string(),
                args: "send-keys".to_string(),
                message: "simulated failure".to_string(),
            });
        }
        let mut state = self.state.lock();
        match state.panes.get_mut(pane) {
            Some(p) if p.alive => {
                p.sent.push(text.to_string());
                Ok(())
            }
            _ => Err(PpgError::CommandFailed {
                program: "tmux".to_string(),
                args: "send-keys".to_string(),
                message: format!("can't find pane: {}", pane),
            }),
        }
    }

    fn is_alive(&self, pane: &str) -> Result<bool> {
        Ok(self.state.lock().panes.get(pane).map(|p| p.alive).unwrap_or(false))
    }

    fn kill_pane(&self, pane: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(p) = state.panes.remove(pane) {
            if let Some(panes) = state.windows.get_mut(&p.window) {
                panes.retain(|id| id != pane);
            }
        }
        Ok(())
    }

    fn kill_window(&self, window: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(panes) = state.windows.remove(window) {
            for pane in panes {
                state.panes.remove(&pane);
            }
        }
        Ok(())
    }

    fn window_exists(&self, window: &str) -> Result<bool> {
        Ok(self.state.lock().windows.contains_key(window))
    }
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        status.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&status.stderr)
    );
}

/// A repository on `main` with one commit containing `README.md`.
pub fn init_repo() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path();
    git(path, &["init", "-q"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(path, &["config", "user.email", "ppg-test@example.com"]);
    git(path, &["config", "user.name", "ppg test"]);
    git(path, &["config", "commit.gpgsign", "false"]);
    fs::write(path.join("README.md"), "hello\n").expect("write README");
    git(path, &["add", "README.md"]);
    git(path, &["commit", "-q", "-m", "initial"]);
    dir
}

pub fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
    fs::write(dir.join(file), content).expect("write file");
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// An initialized project in a fresh repository, driven by a fake multiplexer.
pub fn test_project() -> (TempDir, Project, Arc<FakeMultiplexer>) {
    let repo = init_repo();
    let mux = Arc::new(FakeMultiplexer::new());
    let project = Project::init(repo.path(), mux.clone()).expect("init project");
    (repo, project, mux)
}

/// Write the exit sentinel the wrapped launch command would have written.
pub fn finish_agent(project: &Project, agent_id: &str, code: i32) {
    let path = project.paths.exit_file(agent_id);
    fs::create_dir_all(project.paths.exits_dir()).expect("exits dir");
    fs::write(path, format!("{}\n", code)).expect("write exit file");
}

pub fn write_result(project: &Project, agent_id: &str, body: &str) {
    fs::create_dir_all(project.paths.results_dir()).expect("results dir");
    fs::write(project.paths.result_file(agent_id), body).expect("write result");
}

pub fn hashmap(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
