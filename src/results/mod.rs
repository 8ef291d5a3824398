//! Collects what finished agents produced.

use std::fs;

use serde::Serialize;

use crate::agent;
use crate::error::Result;
use crate::manifest::AgentStatus;
use crate::project::Project;
use crate::session::CaptureScope;

#[derive(Debug, Clone)]
pub enum AggregateScope {
    All,
    Worktree(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    File,
    Pane,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub agent_id: String,
    pub worktree_id: Option<String>,
    pub worktree_name: Option<String>,
    pub branch: Option<String>,
    pub status: AgentStatus,
    pub source: ResultSource,
    pub content: String,
}

/// One item per settled agent: its result file, else its pane scrollback.
/// A missing or unreadable result never fails the whole call.
pub fn aggregate(project: &Project, scope: AggregateScope) -> Result<Vec<AgentResult>> {
    let manifest = agent::refresh_all(project)?;
    let only = match &scope {
        AggregateScope::All => None,
        AggregateScope::Worktree(id) => Some(manifest.resolve_worktree(id)?.id.clone()),
    };

    let mut results = Vec::new();
    for (wt, entry) in manifest.all_agents() {
        if let Some(only) = &only {
            if wt.map(|w| &w.id) != Some(only) {
                continue;
            }
        }
        if !entry.status.is_settled() {
            continue;
        }

        let result_file = project.paths.result_file(&entry.id);
        let (source, content) = match fs::read_to_string(&result_file) {
            Ok(body) => (ResultSource::File, body),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "Could not read {}; falling back to the pane: {}",
                        result_file.display(),
                        e
                    );
                }
                match capture_pane(project, &entry.tmux_target) {
                    Some(text) => (ResultSource::Pane, text),
                    None => (ResultSource::Unavailable, String::new()),
                }
            }
        };

        results.push(AgentResult {
            agent_id: entry.id.clone(),
            worktree_id: wt.map(|w| w.id.clone()),
            worktree_name: wt.map(|w| w.name.clone()),
            branch: wt.map(|w| w.branch.clone()),
            status: entry.status,
            source,
            content,
        });
    }
    Ok(results)
}

fn capture_pane(project: &Project, pane: &str) -> Option<String> {
    match project.mux.is_alive(pane) {
        Ok(true) => {}
        _ => return None,
    }
    match project.mux.capture(pane, CaptureScope::Full) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("Could not capture {}: {}", pane, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{kill, spawn, KillOptions, KillTarget, SpawnRequest};
    use crate::testutil::{finish_agent, test_project, write_result};

    #[test]
    fn test_sources_file_pane_unavailable() {
        let (_repo, project, mux) = test_project();
        let out = spawn(
            &project,
            SpawnRequest {
                count: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let ids: Vec<String> = out.agents.iter().map(|a| a.id.clone()).collect();

        write_result(&project, &ids[0], "# Done\nAll good");
        finish_agent(&project, &ids[0], 0);
        finish_agent(&project, &ids[1], 0);
        kill(&project, KillTarget::Agent(ids[2].clone()), KillOptions::default()).unwrap();
        // ids[3] is still running and is skipped.

        let results = aggregate(&project, AggregateScope::All).unwrap();
        assert_eq!(results.len(), 3);
        let by_id = |id: &str| results.iter().find(|r| r.agent_id == id).unwrap();

        assert_eq!(by_id(&ids[0]).source, ResultSource::File);
        assert_eq!(by_id(&ids[0]).content, "# Done\nAll good");
        assert_eq!(by_id(&ids[1]).source, ResultSource::Pane);
        assert_eq!(by_id(&ids[1]).content, mux.sent(&out.agents[1].tmux_target).join("\n"));
        assert_eq!(by_id(&ids[2]).source, ResultSource::Unavailable);
        assert_eq!(by_id(&ids[2]).status, AgentStatus::Killed);
        assert_eq!(by_id(&ids[0]).branch.as_deref(), Some(out.worktree.unwrap().branch.as_str()));
    }

    #[test]
    fn test_worktree_scope_filters() {
        let (_repo, project, _mux) = test_project();
        let a = spawn(&project, SpawnRequest::default()).unwrap();
        let b = spawn(&project, SpawnRequest::default()).unwrap();
        finish_agent(&project, &a.agents[0].id, 0);
        finish_agent(&project, &b.agents[0].id, 0);

        let wt = a.worktree.unwrap();
        let results = aggregate(&project, AggregateScope::Worktree(wt.name.clone())).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].worktree_id.as_deref(), Some(wt.id.as_str()));
    }

    #[test]
    fn test_unreadable_result_file_falls_back_to_pane() {
        let (_repo, project, _mux) = test_project();
        let out = spawn(&project, SpawnRequest::default()).unwrap();
        let id = out.agents[0].id.clone();
        std::fs::create_dir_all(project.paths.results_dir()).unwrap();
        std::fs::write(project.paths.result_file(&id), [0xff, 0xfe, 0x00]).unwrap();
        finish_agent(&project, &id, 0);

        let results = aggregate(&project, AggregateScope::All).unwrap();
        assert_eq!(results[0].source, ResultSource::Pane);
    }
}
