use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentRegistry;
use crate::error::{PpgError, Result};
use crate::git;
use crate::manifest::{Manifest, ManifestStore};
use crate::session::{Multiplexer, TmuxController};
use crate::storage::{AppConfig, ProjectPaths};
use crate::templates::TemplateEngine;

/// Everything an engine operation needs to know about one repository.
pub struct Project {
    pub paths: ProjectPaths,
    pub config: AppConfig,
    pub store: ManifestStore,
    pub mux: Arc<dyn Multiplexer>,
    session_name: String,
}

impl Project {
    /// Open an initialized project from anywhere inside its repository.
    pub fn open(start: &Path, mux: Arc<dyn Multiplexer>) -> Result<Self> {
        let root = git::repo_root(start)?;
        let paths = ProjectPaths::new(&root);
        let config = paths.load_config()?;
        let store = Self::store_for(&paths, &config);
        let manifest = store.load()?;
        Ok(Self {
            paths,
            config,
            store,
            mux,
            session_name: manifest.session_name,
        })
    }

    /// `open` with the real tmux controller.
    pub fn discover(start: &Path) -> Result<Self> {
        Self::open(start, Arc::new(TmuxController::new()?))
    }

    /// Create `.ppg/`, the default config and the manifest. Safe to repeat.
    pub fn init(start: &Path, mux: Arc<dyn Multiplexer>) -> Result<Self> {
        let root = git::repo_root(start)?;
        let paths = ProjectPaths::new(&root);
        paths.create_layout()?;
        let config = paths.load_config()?;
        let session_name = config
            .session_name
            .clone()
            .unwrap_or_else(|| default_session_name(&root));
        Self::check_session_name(&session_name)?;
        let store = Self::store_for(&paths, &config);
        let existed = store.is_initialized()?;
        let manifest = store.init(root.clone(), &session_name)?;
        if existed {
            tracing::info!("ppg already initialized in {}", root.display());
        } else {
            tracing::info!("ppg initialized in {}", root.display());
        }
        Ok(Self {
            paths,
            config,
            store,
            mux,
            session_name: manifest.session_name,
        })
    }

    fn store_for(paths: &ProjectPaths, config: &AppConfig) -> ManifestStore {
        ManifestStore::open(&paths.ppg_dir())
            .with_lock_timeout(Duration::from_secs(config.lock_timeout_secs.max(1)))
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn manifest(&self) -> Result<Manifest> {
        self.store.load()
    }

    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(&self.config)
    }

    pub fn templates(&self) -> TemplateEngine {
        TemplateEngine::new(&self.paths)
    }

    /// Resolve a user-supplied prompt path against the project root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        }
    }

    /// Fail early when the configured session name would confuse tmux targets.
    pub fn check_session_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains(':') || name.contains('.') {
            return Err(PpgError::InvalidArgs(format!("invalid tmux session name '{}'", name)));
        }
        Ok(())
    }
}

/// `ppg-<repo dir>` with characters tmux treats specially replaced.
pub fn default_session_name(root: &Path) -> String {
    let dir = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let cleaned: String = dir
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("ppg-{}", cleaned)
}
