//! Persistence and the state critical section.
//!
//! Every read-modify-write goes through [`StateStore::transact`], which
//! holds an in-process mutex plus the backend's cross-process lock for the
//! whole load, mutate, save cycle.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::StateConfig;
use crate::core::TaskGraph;
use crate::error::{Error, Result};
use crate::state::document::StateDocument;
use crate::util::write_atomic;

/// Where state documents live.
pub trait StateBackend: Send + Sync {
    /// Take the cross-process lock. Released when the guard drops.
    fn lock(&self) -> Result<BackendLock>;

    /// Read the document. Missing is `StateNotInitialized`, unparseable is
    /// `StateCorrupted`.
    fn read(&self) -> Result<StateDocument>;

    fn write(&self, doc: &StateDocument) -> Result<()>;

    fn exists(&self) -> bool;

    /// Location used in error messages.
    fn location(&self) -> PathBuf;
}

/// Guard for a held backend lock.
///
/// A file lock carries the token written into the lock file. Dropping the
/// guard removes the file only while it still holds that token.
#[derive(Debug)]
pub struct BackendLock {
    held: Option<(PathBuf, String)>,
}

impl BackendLock {
    pub fn none() -> Self {
        Self { held: None }
    }

    fn file(path: PathBuf, token: String) -> Self {
        Self {
            held: Some((path, token)),
        }
    }
}

impl Drop for BackendLock {
    fn drop(&mut self) {
        let Some((path, token)) = self.held.take() else {
            return;
        };
        match fs::read_to_string(&path) {
            Ok(content) if content.trim() == token => {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove state lock");
                }
            }
            Ok(_) => {
                warn!(path = %path.display(), "State lock now held by another owner, leaving it");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State lock vanished while held");
            }
        }
    }
}

/// JSON file per feature with a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    stale_lock_age: Duration,
}

const LOCK_BACKOFF_START: Duration = Duration::from_millis(2);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(50);

impl FileBackend {
    /// Backend for `<dir>/<feature>.json`, creating `dir` if needed.
    pub fn new(dir: &Path, feature: &str, config: &StateConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", feature));
        let lock_path = dir.join(format!("{}.json.lock", feature));
        Ok(Self {
            path,
            lock_path,
            lock_timeout: config.lock_timeout(),
            stale_lock_age: config.stale_lock_age(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn lock_is_stale(&self) -> bool {
        let modified = match fs::metadata(&self.lock_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.stale_lock_age)
            .unwrap_or(false)
    }

    /// Move a stale lock out of the way.
    ///
    /// The lock is renamed to a unique name rather than deleted, so two
    /// contenders cannot both break it. If the file moved turns out not to
    /// be the one judged stale, it is put back.
    fn break_stale_lock(&self, stale_token: &str) {
        let aside = self
            .lock_path
            .with_extension(format!("lock.stale.{}", Uuid::new_v4()));
        if fs::rename(&self.lock_path, &aside).is_err() {
            // Someone else broke it first.
            return;
        }
        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved.trim() != stale_token {
            // A fresh lock was taken between the check and the rename.
            // hard_link fails if the path exists, so a newer lock is never
            // overwritten.
            if let Err(e) = fs::hard_link(&aside, &self.lock_path) {
                warn!(path = %self.lock_path.display(), error = %e, "Could not restore state lock");
            }
        } else {
            warn!(path = %self.lock_path.display(), "Broke stale state lock");
        }
        let _ = fs::remove_file(&aside);
    }
}

fn lock_token() -> String {
    format!("{}:{}", std::process::id(), Uuid::new_v4())
}

impl StateBackend for FileBackend {
    fn lock(&self) -> Result<BackendLock> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut delay = LOCK_BACKOFF_START;
        loop {
            // O_CREAT | O_EXCL: exactly one contender creates the file.
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let token = lock_token();
                    if let Err(e) = writeln!(file, "{}", token).and_then(|_| file.sync_all()) {
                        let _ = fs::remove_file(&self.lock_path);
                        return Err(e.into());
                    }
                    return Ok(BackendLock::file(self.lock_path.clone(), token));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        if let Ok(content) = fs::read_to_string(&self.lock_path) {
                            self.break_stale_lock(content.trim());
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            path: self.lock_path.clone(),
                        });
                    }
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read(&self) -> Result<StateDocument> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StateNotInitialized {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        parse_document(&content, &self.path)
    }

    fn write(&self, doc: &StateDocument) -> Result<()> {
        let contents = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.path, &contents)
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

fn parse_document(content: &str, path: &Path) -> Result<StateDocument> {
    let doc: StateDocument =
        serde_json::from_str(content).map_err(|e| Error::StateCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    doc.check_consistency()
        .map_err(|reason| Error::StateCorrupted {
            path: path.to_path_buf(),
            reason,
        })?;
    Ok(doc)
}

/// In-memory backend for tests and single-process embedding.
///
/// Documents are kept serialized so loads go through the same parsing as
/// the file backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    content: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored bytes verbatim.
    pub fn set_raw(&self, raw: &str) -> Result<()> {
        let mut content = self.content.lock().map_err(|_| Error::LockPoisoned)?;
        *content = Some(raw.to_string());
        Ok(())
    }
}

impl StateBackend for MemoryBackend {
    fn lock(&self) -> Result<BackendLock> {
        Ok(BackendLock::none())
    }

    fn read(&self) -> Result<StateDocument> {
        let content = self.content.lock().map_err(|_| Error::LockPoisoned)?;
        match content.as_deref() {
            Some(raw) => parse_document(raw, &self.location()),
            None => Err(Error::StateNotInitialized {
                path: self.location(),
            }),
        }
    }

    fn write(&self, doc: &StateDocument) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        let mut content = self.content.lock().map_err(|_| Error::LockPoisoned)?;
        *content = Some(raw);
        Ok(())
    }

    fn exists(&self) -> bool {
        self.content
            .lock()
            .map(|content| content.is_some())
            .unwrap_or(false)
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

/// The single source of truth for task, level and worker status.
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    guard: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn StateBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            guard: Mutex::new(()),
            clock,
        }
    }

    /// File-backed store under the configured state directory.
    pub fn open(feature: &str, config: &StateConfig) -> Result<Self> {
        let dir = config.resolved_dir()?;
        let backend = FileBackend::new(&dir, feature, config)?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn location(&self) -> PathBuf {
        self.backend.location()
    }

    /// Write a fresh document for `graph`, replacing any existing one.
    pub fn initialize(&self, graph: &TaskGraph) -> Result<StateDocument> {
        let _guard = self.guard.lock().map_err(|_| Error::LockPoisoned)?;
        let _lock = self.backend.lock()?;
        let doc = StateDocument::from_graph(graph, self.clock.now());
        self.backend.write(&doc)?;
        info!(
            feature = %doc.feature,
            tasks = doc.tasks.len(),
            levels = doc.levels.len(),
            "State initialized"
        );
        Ok(doc)
    }

    /// Resume an existing run for `graph`, or initialize one.
    ///
    /// An existing document must describe the same tasks as the graph.
    pub fn load_or_initialize(&self, graph: &TaskGraph) -> Result<StateDocument> {
        if !self.backend.exists() {
            return self.initialize(graph);
        }
        let doc = self.load()?;
        let same_tasks = doc.task_order.len() == graph.task_count()
            && graph.tasks().iter().all(|t| doc.tasks.contains_key(&t.id));
        if doc.feature != graph.feature() || !same_tasks {
            return Err(Error::StateCorrupted {
                path: self.location(),
                reason: format!(
                    "document for feature {} does not match graph for {}",
                    doc.feature,
                    graph.feature()
                ),
            });
        }
        info!(feature = %doc.feature, "Resuming from existing state");
        Ok(doc)
    }

    /// Read the full document without taking the lock.
    pub fn load(&self) -> Result<StateDocument> {
        self.backend.read()
    }

    /// Snapshot for read-only consumers.
    pub fn snapshot(&self) -> Result<StateDocument> {
        self.load()
    }

    /// Overwrite the document under the lock.
    pub fn save(&self, doc: &StateDocument) -> Result<()> {
        let _guard = self.guard.lock().map_err(|_| Error::LockPoisoned)?;
        let _lock = self.backend.lock()?;
        self.backend.write(doc)
    }

    /// Atomic read-modify-write.
    ///
    /// The closure receives the current document and the transaction time.
    /// If it returns an error nothing is written.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateDocument, DateTime<Utc>) -> Result<T>,
    {
        let _guard = self.guard.lock().map_err(|_| Error::LockPoisoned)?;
        let _lock = self.backend.lock()?;
        let mut doc = self.backend.read()?;
        let now = self.clock.now();
        let before = doc.execution_log.len();
        let out = f(&mut doc, now)?;
        self.backend.write(&doc)?;
        debug!(
            feature = %doc.feature,
            events = doc.execution_log.len() - before,
            "State transaction committed"
        );
        Ok(out)
    }

    /// Project a value out of the current document.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StateDocument) -> T,
    {
        let doc = self.backend.read()?;
        Ok(f(&doc))
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("location", &self.backend.location())
            .finish()
    }
}
