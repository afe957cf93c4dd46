use std::fs::{self, File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::ResourceLimits;
use crate::ConfinementError;

/// A per-launch cgroup v2 directory under a delegated parent.
///
/// The child process joins it between fork and exec by writing to the
/// pre-opened `cgroup.procs`. The directory is removed on drop, which only
/// succeeds once every member has exited.
#[derive(Debug)]
pub struct CgroupSlot {
    path: PathBuf,
    procs: File,
}

impl CgroupSlot {
    pub fn create(
        parent: &Path,
        name: &str,
        limits: ResourceLimits,
    ) -> Result<Self, ConfinementError> {
        let path = parent.join(name);
        fs::create_dir(&path).map_err(|source| ConfinementError::Cgroup {
            path: path.clone(),
            source,
        })?;

        match configure(&path, limits) {
            Ok(procs) => {
                debug!(cgroup = %path.display(), "created launch cgroup");
                Ok(Self { path, procs })
            }
            Err(err) => {
                let _ = fs::remove_dir(&path);
                Err(err)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    /// Number of OOM kills recorded for this cgroup.
    pub fn oom_kills(&self) -> u64 {
        let Ok(events) = fs::read_to_string(self.path.join("memory.events")) else {
            return 0;
        };
        parse_oom_kills(&events)
    }
}

impl Drop for CgroupSlot {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!(cgroup = %self.path.display(), error = %err, "failed to remove launch cgroup");
        }
    }
}

fn configure(path: &Path, limits: ResourceLimits) -> Result<File, ConfinementError> {
    write_control(path, "memory.max", &limits.memory_bytes.to_string())?;
    write_control(path, "pids.max", &limits.max_processes.to_string())?;

    // Optional controls: absent on some kernels.
    if path.join("memory.swap.max").exists() {
        write_control(path, "memory.swap.max", "0")?;
    }
    if path.join("memory.oom.group").exists() {
        write_control(path, "memory.oom.group", "1")?;
    }

    // The kernel provides cgroup.procs; `create` only matters when the parent
    // is a plain directory, which the confiner rejects outside of tests.
    let procs_path = path.join("cgroup.procs");
    OpenOptions::new()
        .write(true)
        .create(true)
        .open(&procs_path)
        .map_err(|source| ConfinementError::Cgroup {
            path: procs_path,
            source,
        })
}

fn write_control(path: &Path, control: &str, value: &str) -> Result<(), ConfinementError> {
    let target = path.join(control);
    fs::write(&target, value).map_err(|source| ConfinementError::Cgroup {
        path: target,
        source,
    })
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
