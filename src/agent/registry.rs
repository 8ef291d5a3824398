use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use super::variant::{self, AgentVariant, VariantKind};
use crate::storage::{AgentTypeConfig, AppConfig, PromptDelivery};

/// Resolves agent type names to launch settings: config entries first, then
/// built-in variants, then the custom fallback.
pub struct AgentRegistry {
    configured: HashMap<String, AgentTypeConfig>,
    default_agent: String,
}

/// An agent type after config overrides were applied.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentType {
    pub name: String,
    pub variant: &'static AgentVariant,
    pub config: AgentTypeConfig,
}

impl AgentType {
    pub fn is_terminal(&self) -> bool {
        self.variant.kind == VariantKind::Terminal
    }
}

/// Per-launch inputs that vary between agents of the same type.
#[derive(Debug, Clone)]
pub struct LaunchInput<'a> {
    pub prompt: &'a str,
    /// Where `file` delivery wrote the prompt.
    pub prompt_file: Option<&'a Path>,
    pub exit_file: &'a Path,
    pub session_id: Option<&'a str>,
}

/// What to type into a fresh pane to start an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Shell line including the exit sentinel; `None` for a bare terminal.
    pub command_line: Option<String>,
    /// Prompt to type into the pane once the command is up.
    pub keys_prompt: Option<String>,
}

impl AgentRegistry {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            configured: config.agents.clone(),
            default_agent: config.default_agent.clone(),
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn resolve(&self, name: &str) -> AgentType {
        let variant = variant::lookup(name).unwrap_or(&variant::CUSTOM);
        let config = self
            .configured
            .get(name)
            .cloned()
            .or_else(|| variant.default_config())
            .unwrap_or_else(|| AgentTypeConfig {
                command: if variant.kind == VariantKind::Terminal {
                    String::new()
                } else {
                    name.to_string()
                },
                prompt_delivery: variant.prompt_delivery,
                prompt_flag: None,
                auto_approve_flag: None,
                session_id_flag: None,
                env: None,
            });

        AgentType {
            name: name.to_string(),
            variant,
            config,
        }
    }

    /// Every type a caller can ask for, built-ins first.
    pub fn list(&self) -> Vec<AgentType> {
        let mut names: Vec<String> = variant::BUILTIN.iter().map(|v| v.id.to_string()).collect();
        let mut extra: Vec<String> = self
            .configured
            .keys()
            .filter(|k| variant::lookup(k).is_none())
            .cloned()
            .collect();
        extra.sort();
        names.extend(extra);
        names.iter().map(|n| self.resolve(n)).collect()
    }

    pub fn build_launch(&self, agent: &AgentType, input: &LaunchInput<'_>) -> LaunchPlan {
        let cfg = &agent.config;
        if agent.is_terminal() || cfg.command.trim().is_empty() {
            return LaunchPlan {
                command_line: None,
                keys_prompt: non_empty(input.prompt),
            };
        }

        let mut parts: Vec<String> = Vec::new();
        if let Some(env) = &cfg.env {
            let mut vars: Vec<_> = env.iter().collect();
            vars.sort();
            for (key, value) in vars {
                parts.push(format!("{}={}", key, shell_quote(value)));
            }
        }
        // The configured command is a shell fragment and is not quoted.
        parts.push(cfg.command.clone());
        if let Some(flag) = &cfg.auto_approve_flag {
            if !cfg.command.contains(flag.as_str()) {
                parts.push(flag.clone());
            }
        }
        if let (Some(flag), Some(id)) = (&cfg.session_id_flag, input.session_id) {
            parts.push(flag.clone());
            parts.push(shell_quote(id));
        }

        let mut keys_prompt = None;
        if !input.prompt.is_empty() {
            let argument = match (cfg.prompt_delivery, input.prompt_file) {
                (PromptDelivery::Arg, _) => Some(shell_quote(input.prompt)),
                (PromptDelivery::File, Some(path)) => Some(format!(
                    "\"$(cat {})\"",
                    shell_quote(&path.to_string_lossy())
                )),
                (PromptDelivery::File, None) => Some(shell_quote(input.prompt)),
                (PromptDelivery::Keys, _) => {
                    keys_prompt = Some(input.prompt.to_string());
                    None
                }
            };
            if let Some(argument) = argument {
                if let Some(flag) = &cfg.prompt_flag {
                    parts.push(flag.clone());
                }
                parts.push(argument);
            }
        }

        let command = parts.join(" ");
        LaunchPlan {
            command_line: Some(with_exit_sentinel(&command, input.exit_file)),
            keys_prompt,
        }
    }
}

/// Record the command's exit status where a status refresh can find it.
pub fn with_exit_sentinel(command: &str, exit_file: &Path) -> String {
    format!(
        "{}; echo $? > {}",
        command,
        shell_quote(&exit_file.to_string_lossy())
    )
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Single-quote `s` for POSIX shells unless it is made only of safe characters.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registry() -> AgentRegistry {
        let mut config = AppConfig::default();
        config.agents.insert(
            "aider".to_string(),
            AgentTypeConfig {
                command: "aider --yes".to_string(),
                prompt_delivery: PromptDelivery::Arg,
                prompt_flag: Some("--message".to_string()),
                auto_approve_flag: None,
                session_id_flag: None,
                env: Some(HashMap::from([("AIDER_DARK".to_string(), "1".to_string())])),
            },
        );
        AgentRegistry::new(&config)
    }

    fn input<'a>(prompt: &'a str, exit: &'a Path) -> LaunchInput<'a> {
        LaunchInput {
            prompt,
            prompt_file: None,
            exit_file: exit,
            session_id: None,
        }
    }

    #[test]
    fn test_build_claude_launch() {
        let reg = registry();
        let exit = PathBuf::from("/repo/.ppg/exits/ag-1");
        let claude = reg.resolve("claude");
        let plan = reg.build_launch(
            &claude,
            &LaunchInput {
                session_id: Some("abc-123"),
                ..input("fix the bug", &exit)
            },
        );
        assert_eq!(
            plan.command_line.as_deref(),
            Some("claude --dangerously-skip-permissions --session-id abc-123 'fix the bug'; echo $? > /repo/.ppg/exits/ag-1")
        );
        assert!(plan.keys_prompt.is_none());
    }

    #[test]
    fn test_configured_type_with_flag_and_env() {
        let reg = registry();
        let exit = PathBuf::from("/x/e");
        let plan = reg.build_launch(&reg.resolve("aider"), &input("it's done", &exit));
        assert_eq!(
            plan.command_line.as_deref(),
            Some("AIDER_DARK=1 aider --yes --message 'it'\\''s done'; echo $? > /x/e")
        );
    }

    #[test]
    fn test_keys_delivery_defers_prompt() {
        let reg = registry();
        let exit = PathBuf::from("/x/e");
        let plan = reg.build_launch(&reg.resolve("opencode"), &input("hello", &exit));
        assert_eq!(plan.command_line.as_deref(), Some("opencode; echo $? > /x/e"));
        assert_eq!(plan.keys_prompt.as_deref(), Some("hello"));
    }

    #[test]
    fn test_file_delivery_reads_prompt_file() {
        let mut config = AppConfig::default();
        if let Some(codex) = config.agents.get_mut("codex") {
            codex.prompt_delivery = PromptDelivery::File;
        }
        let reg = AgentRegistry::new(&config);
        let exit = PathBuf::from("/x/e");
        let file = PathBuf::from("/x/prompt.md");
        let plan = reg.build_launch(
            &reg.resolve("codex"),
            &LaunchInput {
                prompt_file: Some(&file),
                ..input("long prompt", &exit)
            },
        );
        assert_eq!(
            plan.command_line.as_deref(),
            Some("codex --full-auto \"$(cat /x/prompt.md)\"; echo $? > /x/e")
        );
    }

    #[test]
    fn test_terminal_has_no_command() {
        let reg = registry();
        let exit = PathBuf::from("/x/e");
        let plan = reg.build_launch(&reg.resolve("terminal"), &input("ls -la", &exit));
        assert!(plan.command_line.is_none());
        assert_eq!(plan.keys_prompt.as_deref(), Some("ls -la"));
    }

    #[test]
    fn test_unknown_type_falls_back_to_custom() {
        let reg = registry();
        let custom = reg.resolve("my-agent");
        assert_eq!(custom.variant.id, "custom");
        assert_eq!(custom.config.command, "my-agent");
        let exit = PathBuf::from("/x/e");
        let plan = reg.build_launch(&custom, &input("go", &exit));
        assert_eq!(plan.command_line.as_deref(), Some("my-agent go; echo $? > /x/e"));
    }

    #[test]
    fn test_list_includes_configured_types() {
        let names: Vec<String> = registry().list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["claude", "codex", "opencode", "terminal", "aider"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("hello"), "hello");
        assert_eq!(shell_quote("path/to/file"), "path/to/file");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote(""), "''");
    }
}
