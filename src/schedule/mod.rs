//! Cron-driven swarms and prompts, and the daemon that fires them.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::agent::{self, PromptSource, SpawnRequest, SpawnTarget};
use crate::error::{PpgError, Result};
use crate::project::Project;
use crate::storage::{validate_name, ProjectPaths, MAX_NAME_LEN};
use crate::swarm::{self, SwarmOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<String>,
    /// Name of a file in `.ppg/prompts/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub cron: String,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    /// Agent type for prompt schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchedulesFile {
    #[serde(default)]
    schedules: Vec<ScheduleEntry>,
}

/// Run worktrees are named `<schedule>-%Y%m%d%H%M`, and isolated swarms add
/// `-N` on top, so schedule names leave room for both.
const RUN_STAMP_FORMAT: &str = "%Y%m%d%H%M";
const RUN_SUFFIX_LEN: usize = "-202401011200".len() + "-99".len();
const MAX_SCHEDULE_NAME_LEN: usize = MAX_NAME_LEN - RUN_SUFFIX_LEN;

/// Parse a 5-field (minute-first) or 6/7-field (seconds-first) expression.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let expr = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&expr)
        .map_err(|e| PpgError::InvalidArgs(format!("invalid cron expression '{}': {}", expression, e)))
}

impl ScheduleEntry {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.name.len() > MAX_SCHEDULE_NAME_LEN {
            return Err(PpgError::InvalidArgs(format!(
                "schedule name {} is too long ({} > {} characters)",
                self.name,
                self.name.len(),
                MAX_SCHEDULE_NAME_LEN
            )));
        }
        match (&self.swarm, &self.prompt) {
            (Some(_), Some(_)) => {
                return Err(PpgError::InvalidArgs(format!(
                    "schedule {} sets both swarm and prompt",
                    self.name
                )))
            }
            (None, None) => {
                return Err(PpgError::InvalidArgs(format!(
                    "schedule {} needs a swarm or a prompt",
                    self.name
                )))
            }
            _ => {}
        }
        parse_cron(&self.cron)?;
        Ok(())
    }

    /// True when a firing time falls in `(since, now]`.
    pub fn is_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let schedule = parse_cron(&self.cron)?;
        Ok(schedule.after(&since).next().map(|t| t <= now).unwrap_or(false))
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        parse_cron(&self.cron).ok()?.upcoming(Utc).next()
    }
}

/// Load and validate `.ppg/schedules.json`. A missing file means no schedules.
pub fn load_schedules(paths: &ProjectPaths) -> Result<Vec<ScheduleEntry>> {
    let path = paths.schedules_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let file: SchedulesFile = serde_json::from_str(&raw)
        .map_err(|e| PpgError::InvalidArgs(format!("invalid {}: {}", path.display(), e)))?;

    let mut seen = HashSet::new();
    for entry in &file.schedules {
        entry.validate()?;
        if !seen.insert(entry.name.as_str()) {
            return Err(PpgError::InvalidArgs(format!("duplicate schedule name {}", entry.name)));
        }
    }
    Ok(file.schedules)
}

pub fn due_entries<'a>(
    entries: &'a [ScheduleEntry],
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<&'a ScheduleEntry> {
    entries
        .iter()
        .filter(|e| e.is_due(since, now).unwrap_or(false))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReport {
    pub schedule: String,
    pub worktrees: Vec<String>,
    pub agents: Vec<String>,
}

/// Fire one entry through the regular swarm/spawn paths. Each run gets its own
/// timestamped worktree so repeated firings never collide on a branch name.
pub fn trigger(project: &Project, entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<TriggerReport> {
    let run_name = format!("{}-{}", entry.name, now.format(RUN_STAMP_FORMAT));

    let (worktrees, agents) = if let Some(swarm_name) = &entry.swarm {
        let result = swarm::run_swarm(
            project,
            swarm_name,
            SwarmOptions {
                worktree: None,
                vars: entry.vars.clone(),
                name: Some(run_name),
                base: entry.base.clone(),
            },
        )?;
        (
            result.worktrees.into_iter().map(|w| w.id).collect(),
            result.agents.into_iter().map(|a| a.id).collect(),
        )
    } else if let Some(prompt) = &entry.prompt {
        let result = agent::spawn(
            project,
            SpawnRequest {
                target: SpawnTarget::NewWorktree {
                    name: Some(run_name),
                    base: entry.base.clone(),
                },
                agent_type: entry.agent.clone(),
                prompt: PromptSource::Named(prompt.clone()),
                vars: entry.vars.clone(),
                count: 1,
                name: None,
            },
        )?;
        (
            result.worktree.into_iter().map(|w| w.id).collect(),
            result.agents.into_iter().map(|a| a.id).collect(),
        )
    } else {
        return Err(PpgError::InvalidArgs(format!(
            "schedule {} needs a swarm or a prompt",
            entry.name
        )));
    };

    Ok(TriggerReport {
        schedule: entry.name.clone(),
        worktrees,
        agents,
    })
}

/// Append a timestamped line to `.ppg/logs/cron.log`.
pub fn append_log(paths: &ProjectPaths, line: &str) -> Result<()> {
    let path = paths.cron_log_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)?;
    Ok(())
}

fn log_line(paths: &ProjectPaths, line: &str) {
    if let Err(e) = append_log(paths, line) {
        tracing::warn!("Could not write cron log: {}", e);
    }
}

/// Fire every entry due in `(since, now]`. One failing entry does not stop the others.
pub fn run_due(project: &Project, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<TriggerReport>> {
    let entries = load_schedules(&project.paths)?;
    let mut reports = Vec::new();
    for entry in due_entries(&entries, since, now) {
        match trigger(project, entry, now) {
            Ok(report) => {
                tracing::info!(
                    "Schedule {} fired: {} agents",
                    entry.name,
                    report.agents.len()
                );
                log_line(
                    &project.paths,
                    &format!("fired {} agents={}", entry.name, report.agents.join(",")),
                );
                reports.push(report);
            }
            Err(e) => {
                tracing::warn!("Schedule {} failed: {}", entry.name, e);
                log_line(&project.paths, &format!("failed {} [{}] {}", entry.name, e.code(), e));
            }
        }
    }
    Ok(reports)
}

/// `.ppg/cron.pid`, removed again when dropped.
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if pid != std::process::id() && process_alive(pid) {
                return Err(PpgError::InvalidArgs(format!(
                    "schedule daemon already running (pid {})",
                    pid
                )));
            }
            tracing::debug!("Replacing stale pid file for {}", pid);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        fs::write(path, format!("{}\n", pid))?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

pub fn daemon_status(paths: &ProjectPaths) -> DaemonStatus {
    let pid = read_pid(&paths.cron_pid_path()).filter(|pid| process_alive(*pid));
    DaemonStatus {
        running: pid.is_some(),
        pid,
        pid_file: paths.cron_pid_path(),
        log_file: paths.cron_log_path(),
    }
}

/// Send SIGTERM to a running daemon. Returns the pid signalled, if any; a
/// stale pid file is removed.
#[cfg(unix)]
pub fn stop_daemon(paths: &ProjectPaths) -> Result<Option<u32>> {
    let path = paths.cron_pid_path();
    let Some(pid) = read_pid(&path) else {
        return Ok(None);
    };
    if !process_alive(pid) {
        let _ = fs::remove_file(&path);
        return Ok(None);
    }
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(None);
        }
        return Err(err.into());
    }
    tracing::info!("Sent SIGTERM to schedule daemon {}", pid);
    Ok(Some(pid))
}

/// Launch `<exe> cron daemon` detached, with output appended to the cron log.
pub fn start_daemon(paths: &ProjectPaths, exe: &Path) -> Result<u32> {
    let status = daemon_status(paths);
    if let Some(pid) = status.pid {
        return Err(PpgError::InvalidArgs(format!(
            "schedule daemon already running (pid {})",
            pid
        )));
    }
    // Fail fast on a broken schedules file rather than in the background.
    load_schedules(paths)?;

    let log_path = paths.cron_log_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let child = std::process::Command::new(exe)
        .args(["cron", "daemon"])
        .current_dir(paths.root())
        .stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;
    tracing::info!("Started schedule daemon {}", child.id());
    Ok(child.id())
}

#[cfg(not(unix))]
pub fn stop_daemon(_paths: &ProjectPaths) -> Result<Option<u32>> {
    Err(PpgError::InvalidArgs(
        "stopping the daemon is only supported on Unix".to_string(),
    ))
}

pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Tick until SIGTERM/SIGINT, firing due schedules each tick. Schedules are
/// re-read every tick so edits apply without a restart.
pub async fn run_daemon(project: Arc<Project>) -> Result<()> {
    let _pid = PidFile::acquire(&project.paths.cron_pid_path())?;
    // Surface a broken schedules file at startup instead of on the first tick.
    let entries = load_schedules(&project.paths)?;
    tracing::info!("Schedule daemon started with {} schedules", entries.len());
    log_line(
        &project.paths,
        &format!("started pid={} schedules={}", std::process::id(), entries.len()),
    );

    let tick = Duration::from_secs(project.config.scheduler_tick_secs.max(1));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    let mut last_tick = Utc::now();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                let now = Utc::now();
                let since = last_tick;
                last_tick = now;
                let project = Arc::clone(&project);
                match tokio::task::spawn_blocking(move || run_due(&project, since, now)).await {
                    Ok(Ok(reports)) if !reports.is_empty() => {
                        tracing::debug!("Tick fired {} schedules", reports.len());
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Could not load schedules: {}", e),
                    Err(e) => tracing::error!("Schedule tick panicked: {}", e),
                }
            }
        }
    }

    log_line(&project.paths, "stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testutil::test_project;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(cron: &str) -> ScheduleEntry {
        ScheduleEntry {
            name: "nightly".to_string(),
            swarm: None,
            prompt: Some("review".to_string()),
            cron: cron.to_string(),
            vars: HashMap::new(),
            agent: None,
            base: None,
        }
    }

    #[test]
    fn test_parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 0 9 * * Mon-Fri").is_ok());
        let err = parse_cron("every day").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
    }

    #[test]
    fn test_validate_requires_exactly_one_target() {
        assert!(entry("0 9 * * *").validate().is_ok());

        let mut both = entry("0 9 * * *");
        both.swarm = Some("audit".to_string());
        assert!(both.validate().is_err());

        let mut neither = entry("0 9 * * *");
        neither.prompt = None;
        assert!(neither.validate().is_err());

        assert!(entry("61 * * * *").validate().is_err());
    }

    #[test]
    fn test_is_due_window() {
        let e = entry("0 9 * * *");
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 8, 59, 30).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 10).unwrap();
        assert!(e.is_due(before, after).unwrap());
        assert!(!e.is_due(after, after + chrono::Duration::seconds(30)).unwrap());
    }

    #[test]
    fn test_load_schedules() {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path());
        assert!(load_schedules(&paths).unwrap().is_empty());

        fs::create_dir_all(paths.ppg_dir()).unwrap();
        fs::write(
            paths.schedules_path(),
            r#"{"schedules": [{"name": "nightly", "swarm": "audit", "cron": "0 2 * * *"}]}"#,
        )
        .unwrap();
        let loaded = load_schedules(&paths).unwrap();
        assert_eq!(loaded[0].swarm.as_deref(), Some("audit"));

        fs::write(
            paths.schedules_path(),
            r#"{"schedules": [{"name": "x", "swarm": "a", "prompt": "b", "cron": "0 2 * * *"}]}"#,
        )
        .unwrap();
        assert!(load_schedules(&paths).is_err());
    }

    #[test]
    fn test_run_due_fires_prompt_schedule() {
        let (_repo, project, _mux) = test_project();
        fs::write(project.paths.prompts_dir().join("review.md"), "Review {{BRANCH}}").unwrap();
        fs::write(
            project.paths.schedules_path(),
            r#"{"schedules": [{"name": "nightly", "prompt": "review", "cron": "0 9 * * *"}]}"#,
        )
        .unwrap();

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 8, 59, 50).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 20).unwrap();
        let reports = run_due(&project, since, now).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].agents.len(), 1);

        let manifest = project.manifest().unwrap();
        let wt = &manifest.worktrees[&reports[0].worktrees[0]];
        assert_eq!(wt.name, "nightly-202405010900");

        let log = fs::read_to_string(project.paths.cron_log_path()).unwrap();
        assert!(log.contains("fired nightly"));
    }

    #[test]
    fn test_longest_schedule_name_still_fires() {
        let (_repo, project, _mux) = test_project();
        fs::write(project.paths.prompts_dir().join("review.md"), "Review").unwrap();
        let name = "n".repeat(MAX_SCHEDULE_NAME_LEN);
        fs::write(
            project.paths.schedules_path(),
            format!(r#"{{"schedules": [{{"name": "{}", "prompt": "review", "cron": "0 9 * * *"}}]}}"#, name),
        )
        .unwrap();

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 8, 59, 50).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 20).unwrap();
        let reports = run_due(&project, since, now).unwrap();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_schedule_name_leaves_room_for_run_suffix() {
        let mut long = entry("0 9 * * *");
        long.name = "n".repeat(MAX_SCHEDULE_NAME_LEN + 1);
        let err = long.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgs);
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path());
        assert!(!daemon_status(&paths).running);

        {
            let _pid = PidFile::acquire(&paths.cron_pid_path()).unwrap();
            let status = daemon_status(&paths);
            assert!(status.running);
            assert_eq!(status.pid, Some(std::process::id()));
        }
        assert!(!paths.cron_pid_path().exists());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.ppg_dir()).unwrap();
        // Larger than any default pid_max.
        fs::write(paths.cron_pid_path(), "999999999\n").unwrap();
        assert!(!daemon_status(&paths).running);
        let _pid = PidFile::acquire(&paths.cron_pid_path()).unwrap();
        assert_eq!(read_pid(&paths.cron_pid_path()), Some(std::process::id()));
    }
}
