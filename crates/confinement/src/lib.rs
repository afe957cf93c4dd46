//! Confinement of untrusted subprocesses.
//!
//! A [`Confiner`] turns an [`Invocation`] (program, arguments, scratch
//! workspace) into a [`LaunchSpec`] that, when spawned, runs the program
//! inside the isolation boundary configured by [`SandboxConfig`]. Secure mode
//! fails closed: if the confinement tool is missing, refuses to create
//! namespaces, or has no cgroup v2 parent to hold per-launch ceilings, no
//! launch spec is produced.

use std::ffi::OsString;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

mod bubblewrap;
mod cgroup;
mod config;
mod direct;
mod error;
mod spec;

pub use bubblewrap::{BubblewrapConfiner, DEFAULT_TOOL, SANDBOX_WORKDIR};
pub use cgroup::CgroupSlot;
pub use config::{ResourceLimits, SandboxConfig, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_PIDS_MAX};
pub use direct::DirectConfiner;
pub use error::ConfinementError;
pub use spec::{ConfinementMode, Invocation, LaunchSpec};

/// Search path given to every launched program.
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[async_trait]
pub trait Confiner: Send + Sync + Debug {
    fn mode(&self) -> ConfinementMode;

    /// Describe how to launch `invocation` under this confiner.
    fn launch_spec(&self, invocation: &Invocation) -> Result<LaunchSpec, ConfinementError>;

    /// Verify the isolation boundary can actually be established on this
    /// host. Called once at startup.
    async fn check_host(&self) -> Result<(), ConfinementError> {
        Ok(())
    }
}

/// Select the confiner for a configuration.
pub fn build_confiner(config: &SandboxConfig) -> Result<Arc<dyn Confiner>, ConfinementError> {
    config.validate()?;

    if config.secure_mode {
        return Ok(Arc::new(BubblewrapConfiner::new(config)?));
    }

    warn!("secure mode disabled; untrusted programs will run directly on the host");
    Ok(Arc::new(DirectConfiner::new()))
}

pub(crate) fn base_env(home: &Path) -> Vec<(OsString, OsString)> {
    vec![
        (OsString::from("PATH"), OsString::from(SANDBOX_PATH)),
        (OsString::from("HOME"), home.as_os_str().to_owned()),
    ]
}

pub(crate) fn check_workspace(path: &Path) -> Result<(), ConfinementError> {
    if !path.is_absolute() {
        return Err(ConfinementError::Workspace {
            path: path.to_path_buf(),
            reason: "path must be absolute".to_string(),
        });
    }
    if !path.is_dir() {
        return Err(ConfinementError::Workspace {
            path: path.to_path_buf(),
            reason: "not an existing directory".to_string(),
        });
    }
    Ok(())
}
