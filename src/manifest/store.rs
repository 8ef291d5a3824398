use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use super::{Manifest, MANIFEST_VERSION};
use crate::error::{PpgError, Result};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Held for the duration of a locked mutation; dropping it releases the lock.
pub trait LockHandle: Send {}

/// Raw storage for the manifest document plus its exclusive lock.
pub trait ManifestBackend: Send + Sync {
    /// Last fully written document, or `None` if none was ever written.
    fn read(&self) -> Result<Option<String>>;
    /// Replace the document. Readers see either the old or the new contents.
    fn write_atomic(&self, contents: &str) -> Result<()>;
    /// Non-blocking lock attempt; `Ok(None)` means someone else holds it.
    fn try_lock(&self) -> Result<Option<Box<dyn LockHandle>>>;
    fn location(&self) -> PathBuf;
}

/// `manifest.json` next to a `manifest.lock` file guarded with `flock`.
pub struct FileBackend {
    manifest_path: PathBuf,
    lock_path: PathBuf,
}

impl FileBackend {
    pub fn new(ppg_dir: &Path) -> Self {
        Self {
            manifest_path: ppg_dir.join("manifest.json"),
            lock_path: ppg_dir.join("manifest.lock"),
        }
    }
}

struct FileLock(File);

impl LockHandle for FileLock {}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl ManifestBackend for FileBackend {
    fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.manifest_path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, contents: &str) -> Result<()> {
        let dir = self
            .manifest_path
            .parent()
            .ok_or_else(|| PpgError::InvalidArgs("manifest path has no parent".to_string()))?;
        fs::create_dir_all(dir)?;

        // Same directory as the target so the rename never crosses filesystems.
        let mut tmp = tempfile::Builder::new()
            .prefix(".manifest.")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.manifest_path).map_err(|e| PpgError::Io(e.error))?;
        Ok(())
    }

    fn try_lock(&self) -> Result<Option<Box<dyn LockHandle>>> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Box::new(FileLock(file)))),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> PathBuf {
        self.manifest_path.clone()
    }
}

/// Process-local backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    contents: Mutex<Option<String>>,
    locked: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryLock(Arc<AtomicBool>);

impl LockHandle for MemoryLock {}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ManifestBackend for MemoryBackend {
    fn read(&self) -> Result<Option<String>> {
        Ok(self.contents.lock().clone())
    }

    fn write_atomic(&self, contents: &str) -> Result<()> {
        *self.contents.lock() = Some(contents.to_string());
        Ok(())
    }

    fn try_lock(&self) -> Result<Option<Box<dyn LockHandle>>> {
        match self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(Some(Box::new(MemoryLock(Arc::clone(&self.locked))))),
            Err(_) => Ok(None),
        }
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

/// Called with every manifest this store writes, after the lock is released.
pub type ManifestObserver = Arc<dyn Fn(&Manifest) + Send + Sync>;

/// The single serialization point for manifest mutation.
#[derive(Clone)]
pub struct ManifestStore {
    backend: Arc<dyn ManifestBackend>,
    lock_timeout: Duration,
    observers: Arc<RwLock<Vec<ManifestObserver>>>,
}

impl ManifestStore {
    pub fn new(backend: Arc<dyn ManifestBackend>) -> Self {
        Self {
            backend,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register `observer` on this store and every clone of it.
    pub fn observe(&self, observer: ManifestObserver) {
        self.observers.write().push(observer);
    }

    fn notify(&self, manifest: &Manifest) {
        for observer in self.observers.read().iter() {
            observer(manifest);
        }
    }

    /// File-backed store rooted at a project's `.ppg` directory.
    pub fn open(ppg_dir: &Path) -> Self {
        Self::new(Arc::new(FileBackend::new(ppg_dir)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.backend.read()?.is_some())
    }

    /// Lock-free read of the last complete manifest.
    pub fn load(&self) -> Result<Manifest> {
        match self.backend.read()? {
            Some(raw) => Self::parse(&raw),
            None => Err(PpgError::NotInitialized(self.backend.location())),
        }
    }

    /// Create the manifest unless one already exists; returns whichever is stored.
    pub fn init(&self, project_root: PathBuf, session_name: &str) -> Result<Manifest> {
        let _guard = self.acquire()?;
        if let Some(raw) = self.backend.read()? {
            return Self::parse(&raw);
        }
        let manifest = Manifest::new(project_root, session_name);
        self.backend
            .write_atomic(&serde_json::to_string_pretty(&manifest)?)?;
        tracing::info!("Initialized manifest at {}", self.backend.location().display());
        Ok(manifest)
    }

    /// Lock, load, mutate, write, unlock. Nothing is written if `f` fails.
    ///
    /// Callers must not run external processes inside `f`.
    pub fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Manifest) -> Result<T>,
    {
        let guard = self.acquire()?;
        let mut manifest = self.load()?;
        let out = f(&mut manifest)?;
        manifest.check_unique_agent_ids()?;
        manifest.updated_at = Utc::now();
        self.backend
            .write_atomic(&serde_json::to_string_pretty(&manifest)?)?;
        drop(guard);
        self.notify(&manifest);
        Ok(out)
    }

    fn acquire(&self) -> Result<Box<dyn LockHandle>> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(handle) = self.backend.try_lock()? {
                return Ok(handle);
            }
            if started.elapsed() >= self.lock_timeout {
                tracing::warn!(
                    "Manifest lock at {} still held after {:?}",
                    self.backend.location().display(),
                    self.lock_timeout
                );
                return Err(PpgError::ManifestLock(self.lock_timeout));
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn parse(raw: &str) -> Result<Manifest> {
        let header: VersionHeader = serde_json::from_str(raw).map_err(PpgError::ManifestParse)?;
        if header.version != MANIFEST_VERSION {
            return Err(PpgError::ManifestSchema {
                found: header.version,
                expected: MANIFEST_VERSION,
            });
        }
        serde_json::from_str(raw).map_err(PpgError::ManifestParse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        generate_agent_id, unique_id, AgentEntry, AgentLocation, AgentStatus,
    };
    use tempfile::TempDir;

    fn file_store() -> (ManifestStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(&dir.path().join(".ppg"));
        store.init(dir.path().to_path_buf(), "ppg-test").unwrap();
        (store, dir)
    }

    fn root_agent(id: String) -> AgentEntry {
        AgentEntry {
            id: id.clone(),
            name: id,
            agent_type: "claude".to_string(),
            status: AgentStatus::Running,
            tmux_target: "ppg-test:0.0".to_string(),
            prompt: String::new(),
            started_at: Utc::now(),
            exit_code: None,
            session_id: None,
        }
    }

    #[test]
    fn test_load_before_init_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(&dir.path().join(".ppg"));
        assert!(matches!(store.load(), Err(PpgError::NotInitialized(_))));
        assert!(!store.is_initialized().unwrap());
    }

    #[test]
    fn test_init_is_idempotent() {
        let (store, dir) = file_store();
        let first = store.load().unwrap();
        let second = store.init(dir.path().to_path_buf(), "other-name").unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.session_name, "ppg-test");
    }

    #[test]
    fn test_round_trip_through_atomic_write() {
        let (store, _dir) = file_store();
        let written = store
            .with_lock(|m| {
                let id = unique_id(m, generate_agent_id);
                m.insert_agent(&AgentLocation::Root, root_agent(id))?;
                Ok(m.clone())
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.agents, written.agents);
        assert_eq!(loaded.session_name, written.session_name);
        assert!(loaded.updated_at >= written.updated_at);
    }

    #[test]
    fn test_failed_mutation_writes_nothing() {
        let (store, _dir) = file_store();
        let before = store.load().unwrap();
        let result: Result<()> = store.with_lock(|m| {
            m.session_name = "changed".to_string();
            Err(PpgError::InvalidArgs("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.load().unwrap(), before);
    }

    #[test]
    fn test_interrupted_write_leaves_prior_manifest() {
        let (store, dir) = file_store();
        let before = store.load().unwrap();

        // A crash after the temp file is written but before the rename.
        let stale = dir.path().join(".ppg").join(".manifest.crash.tmp");
        fs::write(&stale, "{\"version\": 1, \"truncat").unwrap();

        let after = store.load().unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_garbage_manifest_is_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let ppg_dir = dir.path().join(".ppg");
        fs::create_dir_all(&ppg_dir).unwrap();
        fs::write(ppg_dir.join("manifest.json"), "not json").unwrap();

        let err = ManifestStore::open(&ppg_dir).load().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidManifest);
    }

    #[test]
    fn test_unknown_schema_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ppg_dir = dir.path().join(".ppg");
        fs::create_dir_all(&ppg_dir).unwrap();
        fs::write(ppg_dir.join("manifest.json"), "{\"version\": 7}").unwrap();

        let store = ManifestStore::open(&ppg_dir);
        match store.load() {
            Err(PpgError::ManifestSchema { found, expected }) => {
                assert_eq!(found, 7);
                assert_eq!(expected, MANIFEST_VERSION);
            }
            other => panic!("expected schema error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_agent_ids_are_never_written() {
        let store = ManifestStore::in_memory();
        store.init(PathBuf::from("/repo"), "ppg-repo").unwrap();
        store
            .with_lock(|m| m.insert_agent(&AgentLocation::Root, root_agent("ag-1".to_string())))
            .unwrap();

        let err = store
            .with_lock(|m| {
                m.agents.insert("ag-other".to_string(), root_agent("ag-1".to_string()));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgs);
        assert_eq!(store.load().unwrap().agents.len(), 1);
    }

    #[test]
    fn test_observers_see_every_write() {
        let store = ManifestStore::in_memory();
        store.init(PathBuf::from("/repo"), "ppg-repo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.clone().observe(Arc::new(move |m: &Manifest| sink.lock().push(m.agents.len())));

        store
            .with_lock(|m| m.insert_agent(&AgentLocation::Root, root_agent("ag-1".to_string())))
            .unwrap();
        let _ = store.with_lock(|_| Err::<(), _>(PpgError::InvalidArgs("no".to_string())));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_lock_timeout_reports_manifest_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ManifestStore::new(backend.clone())
            .with_lock_timeout(Duration::from_millis(50));
        store.init(PathBuf::from("/repo"), "ppg-repo").unwrap();

        let _held = backend.try_lock().unwrap().unwrap();
        let err = store.with_lock(|_| Ok(())).unwrap_err();
        assert!(matches!(err, PpgError::ManifestLock(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let (store, _dir) = file_store();
        let writers = 8;

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .with_lock(|m| {
                            let id = unique_id(m, generate_agent_id);
                            m.insert_agent(&AgentLocation::Root, root_agent(id.clone()))?;
                            Ok(id)
                        })
                        .unwrap()
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let manifest = store.load().unwrap();
        assert_eq!(manifest.agents.len(), writers);
        for id in ids {
            assert!(manifest.agents.contains_key(&id));
        }
        manifest.check_unique_agent_ids().unwrap();
    }
}
