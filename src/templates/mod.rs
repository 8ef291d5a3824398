//! Prompt files, templates and swarm definitions under `.ppg/`, plus
//! `{{VAR}}` rendering.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

use crate::error::{PpgError, Result};
use crate::storage::ProjectPaths;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("Invalid placeholder regex")
});

static TEMPLATE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("Invalid template name regex")
});

/// Variables ppg fills in for every rendered prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub worktree_path: String,
    pub branch: String,
    pub agent_id: String,
    pub result_file: String,
    pub project_root: String,
    pub task_name: String,
    /// User-supplied; these win over the built-ins on a name clash.
    pub variables: HashMap<String, String>,
}

impl PromptContext {
    fn lookup(&self, key: &str) -> Option<&str> {
        if let Some(v) = self.variables.get(key) {
            return Some(v);
        }
        match key {
            "WORKTREE_PATH" => Some(&self.worktree_path),
            "BRANCH" => Some(&self.branch),
            "AGENT_ID" => Some(&self.agent_id),
            "RESULT_FILE" => Some(&self.result_file),
            "PROJECT_ROOT" => Some(&self.project_root),
            "TASK_NAME" => Some(&self.task_name),
            _ => None,
        }
    }
}

/// Substitute `{{VAR}}` placeholders. Unknown names are left untouched so a
/// prompt can still mention literal braces.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match ctx.lookup(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Templates,
    Prompts,
    Swarms,
}

impl std::str::FromStr for ListKind {
    type Err = PpgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "templates" => Ok(Self::Templates),
            "prompts" => Ok(Self::Prompts),
            "swarms" => Ok(Self::Swarms),
            other => Err(PpgError::InvalidArgs(format!(
                "unknown list kind '{}' (expected templates, prompts or swarms)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub name: String,
    pub path: PathBuf,
    /// First non-empty line, stripped of Markdown heading marks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Reads prompt material from a project's `.ppg` directory.
pub struct TemplateEngine {
    templates_dir: PathBuf,
    prompts_dir: PathBuf,
    swarms_dir: PathBuf,
}

impl TemplateEngine {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            templates_dir: paths.templates_dir(),
            prompts_dir: paths.prompts_dir(),
            swarms_dir: paths.swarms_dir(),
        }
    }

    pub fn load_template(&self, name: &str) -> Result<String> {
        read_named(&self.templates_dir, name, "md")
    }

    pub fn load_prompt(&self, name: &str) -> Result<String> {
        read_named(&self.prompts_dir, name, "md")
    }

    /// Raw JSON of `.ppg/swarms/<name>.json`.
    pub fn load_swarm_source(&self, name: &str) -> Result<String> {
        read_named(&self.swarms_dir, name, "json")
    }

    pub fn save_template(&self, name: &str, content: &str) -> Result<()> {
        validate_template_name(name)?;
        fs::create_dir_all(&self.templates_dir)?;
        fs::write(self.templates_dir.join(format!("{}.md", name)), content)?;
        Ok(())
    }

    pub fn list(&self, kind: ListKind) -> Result<Vec<TemplateInfo>> {
        match kind {
            ListKind::Templates => list_dir(&self.templates_dir, "md"),
            ListKind::Prompts => list_dir(&self.prompts_dir, "md"),
            ListKind::Swarms => list_dir(&self.swarms_dir, "json"),
        }
    }
}

pub fn validate_template_name(name: &str) -> Result<()> {
    if !TEMPLATE_NAME.is_match(name) || name.len() > 128 {
        return Err(PpgError::InvalidArgs(format!("invalid template name '{}'", name)));
    }
    Ok(())
}

fn read_named(dir: &Path, name: &str, ext: &str) -> Result<String> {
    validate_template_name(name)?;
    let path = dir.join(format!("{}.{}", name, ext));
    if !path.is_file() {
        return Err(PpgError::PromptNotFound(path.display().to_string()));
    }
    Ok(fs::read_to_string(path)?)
}

fn list_dir(dir: &Path, ext: &str) -> Result<Vec<TemplateInfo>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let summary = if ext == "md" {
            fs::read_to_string(&path).ok().and_then(|body| {
                body.lines()
                    .map(|l| l.trim_start_matches('#').trim())
                    .find(|l| !l.is_empty())
                    .map(String::from)
            })
        } else {
            None
        };
        out.push(TemplateInfo { name, path, summary });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_builtins_and_vars() {
        let ctx = PromptContext {
            branch: "ppg/feature-x".to_string(),
            agent_id: "ag-12345678".to_string(),
            variables: HashMap::from([("ISSUE".to_string(), "42".to_string())]),
            ..Default::default()
        };
        let out = render("Fix #{{ISSUE}} on {{BRANCH}} as {{ AGENT_ID }}.", &ctx);
        assert_eq!(out, "Fix #42 on ppg/feature-x as ag-12345678.");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let out = render("keep {{UNKNOWN}} and {{ not valid }}", &PromptContext::default());
        assert_eq!(out, "keep {{UNKNOWN}} and {{ not valid }}");
    }

    #[test]
    fn test_user_vars_override_builtins() {
        let ctx = PromptContext {
            branch: "ppg/a".to_string(),
            variables: HashMap::from([("BRANCH".to_string(), "custom".to_string())]),
            ..Default::default()
        };
        assert_eq!(render("{{BRANCH}}", &ctx), "custom");
    }

    #[test]
    fn test_load_and_list() {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path());
        paths.create_layout().unwrap();
        fs::write(paths.prompts_dir().join("review.md"), "# Review code\nBody").unwrap();
        fs::write(paths.prompts_dir().join("notes.txt"), "ignored").unwrap();

        let engine = TemplateEngine::new(&paths);
        assert_eq!(engine.load_prompt("review").unwrap(), "# Review code\nBody");

        let prompts = engine.list(ListKind::Prompts).unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].summary.as_deref(), Some("Review code"));
        assert!(engine.list(ListKind::Swarms).unwrap().is_empty());

        engine.save_template("fix_tests", "Fix {{TASK_NAME}}").unwrap();
        assert_eq!(engine.list(ListKind::Templates).unwrap()[0].name, "fix_tests");
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let engine = TemplateEngine::new(&ProjectPaths::new(dir.path()));
        let err = engine.load_template("nope").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PromptNotFound);
        let err = engine.load_template("../secrets").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgs);
    }
}
