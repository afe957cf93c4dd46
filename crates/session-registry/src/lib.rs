//! Registry of live sessions.
//!
//! Every execution and every bridge session is opened here before it touches
//! the filesystem or spawns a process. The registry hands out a unique
//! scratch workspace per session, remembers the process group attached to
//! it, and releases both on close. Closing is idempotent and also happens
//! when the [`SessionHandle`] is dropped, so abandoned work is reclaimed.
//! Async callers close with [`SessionHandle::close_async`], which deletes the
//! workspace on the blocking pool instead of the runtime thread.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Execution,
    Bridge,
}

impl SessionKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SessionKind::Execution => "exec",
            SessionKind::Bridge => "lsp",
        }
    }
}

/// Identifies one session. Rendered as `<prefix>-<uuid>`, which is also the
/// name of its workspace directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    kind: SessionKind,
    id: Uuid,
}

impl SessionKey {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.id)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Session {key} is already open")]
    AlreadyOpen { key: SessionKey },

    #[error("Session {key} is not open")]
    NotOpen { key: SessionKey },

    #[error("Scratch root {path} is unusable: {source}")]
    ScratchRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::AlreadyOpen { .. } => "SESSION_ALREADY_OPEN",
            RegistryError::NotOpen { .. } => "SESSION_NOT_OPEN",
            RegistryError::ScratchRoot { .. } => "SCRATCH_ROOT_UNAVAILABLE",
            RegistryError::Workspace { .. } => "WORKSPACE_CREATE_FAILED",
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    workspace: PathBuf,
    process_group: Option<i32>,
}

#[derive(Debug)]
struct Inner {
    scratch_root: PathBuf,
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
}

/// Shared, internally synchronized session table. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create a registry whose workspaces live under `scratch_root`. The root
    /// is created with owner-only permissions when missing.
    pub fn new(scratch_root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let scratch_root = scratch_root.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&scratch_root)
            .map_err(|source| RegistryError::ScratchRoot {
                path: scratch_root.clone(),
                source,
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                scratch_root,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.inner.scratch_root
    }

    /// Open a session under a fresh key.
    pub fn open(&self, kind: SessionKind) -> Result<SessionHandle, RegistryError> {
        self.open_key(SessionKey::new(kind))
    }

    /// Open a session under `key`. Fails if the key is already active or its
    /// workspace directory already exists on disk.
    pub fn open_key(&self, key: SessionKey) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&key) {
            return Err(RegistryError::AlreadyOpen { key });
        }

        let workspace = self.inner.scratch_root.join(key.to_string());
        // Non-recursive create refuses an existing directory, so a stale or
        // foreign path is never reused.
        DirBuilder::new()
            .mode(0o700)
            .create(&workspace)
            .map_err(|source| RegistryError::Workspace {
                path: workspace.clone(),
                source,
            })?;

        sessions.insert(
            key,
            SessionEntry {
                workspace: workspace.clone(),
                process_group: None,
            },
        );
        drop(sessions);

        debug!(session = %key, workspace = %workspace.display(), "session opened");
        Ok(SessionHandle {
            key,
            workspace,
            registry: self.clone(),
        })
    }

    /// Record the process group leader spawned for a session. The whole group
    /// is killed when the session closes.
    pub fn attach_process(&self, key: SessionKey, pid: u32) -> Result<(), RegistryError> {
        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(&key)
            .ok_or(RegistryError::NotOpen { key })?;
        entry.process_group = i32::try_from(pid).ok();
        Ok(())
    }

    /// Forget the process group of a session whose owner already reclaimed it.
    pub fn detach_process(&self, key: SessionKey) {
        if let Some(entry) = self.sessions().get_mut(&key) {
            entry.process_group = None;
        }
    }

    /// Close a session: kill its process group and delete its workspace.
    /// Returns false when the session was not open. Cleanup failures are
    /// logged, never returned.
    pub fn close(&self, key: SessionKey) -> bool {
        let entry = self.sessions().remove(&key);
        match entry {
            Some(entry) => {
                release(key, entry);
                true
            }
            None => false,
        }
    }

    /// Same as [`SessionRegistry::close`], with the workspace deleted on the
    /// blocking pool. The workspace is gone once the future completes.
    pub async fn close_async(&self, key: SessionKey) -> bool {
        let entry = self.sessions().remove(&key);
        match entry {
            Some(entry) => {
                release_async(vec![(key, entry)]).await;
                true
            }
            None => false,
        }
    }

    /// Close every open session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions().drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            release(key, entry);
        }
        count
    }

    pub async fn close_all_async(&self) -> usize {
        let drained: Vec<_> = self.sessions().drain().collect();
        let count = drained.len();
        release_async(drained).await;
        count
    }

    pub fn is_open(&self, key: SessionKey) -> bool {
        self.sessions().contains_key(&key)
    }

    pub fn active(&self) -> usize {
        self.sessions().len()
    }

    pub fn active_by_kind(&self, kind: SessionKind) -> usize {
        self.sessions().keys().filter(|key| key.kind == kind).count()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, SessionEntry>> {
        // Entries stay consistent across a panicking holder: every mutation is
        // a single insert, remove or field store.
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn release(key: SessionKey, entry: SessionEntry) {
    kill_group(key, &entry);
    remove_workspace(key, &entry.workspace);
}

// Signals go out inline so nothing keeps writing while the tree is removed.
async fn release_async(entries: Vec<(SessionKey, SessionEntry)>) {
    for (key, entry) in &entries {
        kill_group(*key, entry);
    }
    let removal = tokio::task::spawn_blocking(move || {
        for (key, entry) in entries {
            remove_workspace(key, &entry.workspace);
        }
    });
    if let Err(err) = removal.await {
        warn!(error = %err, "workspace removal task failed");
    }
}

fn kill_group(key: SessionKey, entry: &SessionEntry) {
    if let Some(pgid) = entry.process_group {
        match kill_process_group(pgid) {
            Ok(()) => debug!(session = %key, pgid, "killed session process group"),
            Err(err) => warn!(session = %key, pgid, error = %err, "failed to kill session process group"),
        }
    }
}

fn remove_workspace(key: SessionKey, workspace: &Path) {
    match fs::remove_dir_all(workspace) {
        Ok(()) => debug!(session = %key, "session closed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(session = %key, "session closed; workspace already gone")
        }
        Err(err) => warn!(
            session = %key,
            workspace = %workspace.display(),
            error = %err,
            "failed to remove session workspace"
        ),
    }
}

/// Owner's view of an open session. Dropping it closes the session.
#[derive(Debug)]
pub struct SessionHandle {
    key: SessionKey,
    workspace: PathBuf,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn attach_process(&self, pid: u32) -> Result<(), RegistryError> {
        self.registry.attach_process(self.key, pid)
    }

    pub fn detach_process(&self) {
        self.registry.detach_process(self.key)
    }

    pub fn close(self) {
        // Drop does the work.
    }

    /// Close without blocking the async runtime on workspace deletion.
    pub async fn close_async(self) {
        self.registry.close_async(self.key).await;
        // The entry is gone, so the drop that follows is a no-op.
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.close(self.key);
    }
}

/// Send SIGKILL to every member of process group `pgid`. A group that no
/// longer exists is not an error.
pub fn kill_process_group(pgid: i32) -> io::Result<()> {
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {}", pgid),
        ));
    }

    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
