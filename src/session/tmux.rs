use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use super::{CaptureScope, Multiplexer, SendOptions, WindowRef};
use crate::error::{PpgError, Result};

/// tmux errors that just mean "that target is already gone".
const MISSING_TARGET_MARKERS: &[&str] = &[
    "can't find",
    "no such",
    "no server running",
    "session not found",
    "window not found",
    "pane not found",
];

/// Drives the `tmux` binary. Panes and windows are addressed by their stable
/// ids (`%12`, `@4`) so killing one pane never renumbers another agent's target.
pub struct TmuxController {
    binary: String,
}

impl TmuxController {
    /// Look for tmux once; a missing binary is fatal and never retried.
    pub fn new() -> Result<Self> {
        Self::with_binary("tmux")
    }

    pub fn with_binary(binary: impl Into<String>) -> Result<Self> {
        let controller = Self {
            binary: binary.into(),
        };
        let version = controller.run(&["-V"])?;
        tracing::debug!("Using {}", version.trim());
        Ok(controller)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!("tmux {:?}", args);
        let output = Command::new(&self.binary).args(args).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                PpgError::TmuxNotFound
            } else {
                PpgError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PpgError::CommandFailed {
                program: self.binary.clone(),
                args: args.join(" "),
                message: if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command whose failure on a missing target is a normal answer.
    fn run_tolerant(&self, args: &[&str]) -> Result<Option<String>> {
        match self.run(args) {
            Ok(out) => Ok(Some(out)),
            Err(PpgError::CommandFailed { message, .. }) if is_missing_target(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn has_session(&self, name: &str) -> Result<bool> {
        let target = format!("={}", name);
        Ok(self.run_tolerant(&["has-session", "-t", &target])?.is_some())
    }
}

fn is_missing_target(message: &str) -> bool {
    let lower = message.to_lowercase();
    MISSING_TARGET_MARKERS.iter().any(|m| lower.contains(m))
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| PpgError::InvalidArgs(format!("non-UTF-8 path: {}", path.display())))
}

impl Multiplexer for TmuxController {
    fn ensure_session(&self, name: &str, cwd: &Path) -> Result<()> {
        if self.has_session(name)? {
            return Ok(());
        }
        match self.run(&["new-session", "-d", "-s", name, "-c", path_arg(cwd)?]) {
            Ok(_) => {
                tracing::info!("Created tmux session {}", name);
                Ok(())
            }
            Err(e) => {
                // Another ppg process may have won the race.
                if self.has_session(name)? {
                    tracing::debug!("Session {} appeared concurrently: {}", name, e);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn create_window(&self, session: &str, label: &str, cwd: &Path) -> Result<WindowRef> {
        let target = format!("={}:", session);
        let out = self.run(&[
            "new-window",
            "-d",
            "-t",
            &target,
            "-n",
            label,
            "-c",
            path_arg(cwd)?,
            "-P",
            "-F",
            "#{window_id} #{pane_id}",
        ])?;

        let mut parts = out.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(window), Some(pane)) => Ok(WindowRef {
                window: window.to_string(),
                pane: pane.to_string(),
            }),
            _ => Err(PpgError::CommandFailed {
                program: self.binary.clone(),
                args: "new-window".to_string(),
                message: format!("unexpected output: {}", out.trim()),
            }),
        }
    }

    fn create_pane(&self, window: &str, cwd: &Path) -> Result<String> {
        let out = self.run(&[
            "split-window",
            "-d",
            "-t",
            window,
            "-c",
            path_arg(cwd)?,
            "-P",
            "-F",
            "#{pane_id}",
        ])?;
        if let Err(e) = self.run(&["select-layout", "-t", window, "tiled"]) {
            tracing::debug!("Could not retile {}: {}", window, e);
        }
        Ok(out.trim().to_string())
    }

    fn capture(&self, pane: &str, scope: CaptureScope) -> Result<String> {
        let start = match scope {
            CaptureScope::Lines(n) => format!("-{}", n),
            CaptureScope::Full => "-".to_string(),
        };
        self.run(&["capture-pane", "-p", "-J", "-t", pane, "-S", &start])
    }

    fn send_keys(&self, pane: &str, text: &str, opts: SendOptions) -> Result<()> {
        if !text.is_empty() {
            if opts.literal {
                self.run(&["send-keys", "-t", pane, "-l", "--", text])?;
            } else {
                let mut args = vec!["send-keys", "-t", pane];
                args.extend(text.split_whitespace());
                self.run(&args)?;
            }
        }
        if opts.append_enter {
            self.run(&["send-keys", "-t", pane, "Enter"])?;
        }
        Ok(())
    }

    fn is_alive(&self, pane: &str) -> Result<bool> {
        let out = self.run_tolerant(&["display-message", "-p", "-t", pane, "#{pane_dead}"])?;
        Ok(matches!(out, Some(flag) if flag.trim() == "0"))
    }

    fn kill_pane(&self, pane: &str) -> Result<()> {
        self.run_tolerant(&["kill-pane", "-t", pane])?;
        Ok(())
    }

    fn kill_window(&self, window: &str) -> Result<()> {
        self.run_tolerant(&["kill-window", "-t", window])?;
        Ok(())
    }

    fn window_exists(&self, window: &str) -> Result<bool> {
        Ok(self
            .run_tolerant(&["display-message", "-p", "-t", window, "#{window_id}"])?
            .is_some())
    }
}
