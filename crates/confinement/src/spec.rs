use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::cgroup::CgroupSlot;
use crate::config::ResourceLimits;

/// Whether a launch runs inside the isolation boundary or directly on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfinementMode {
    Confined,
    Unconfined,
}

impl ConfinementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfinementMode::Confined => "confined",
            ConfinementMode::Unconfined => "unconfined",
        }
    }
}

/// The program a caller wants to run, before confinement is applied.
///
/// `workspace` becomes the working directory of the program; arguments that
/// name files inside it should be relative so they resolve the same way with
/// or without a mount namespace.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workspace: PathBuf,
    /// Short unique name for per-launch resources such as the cgroup.
    pub label: String,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            workspace: workspace.into(),
            label: "launch".to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A ready-to-spawn process description produced by a [`crate::Confiner`].
///
/// Owned by the invocation that requested it. Dropping it releases per-launch
/// resources (the cgroup, when one was created), so keep it alive until the
/// process has been reaped.
#[derive(Debug)]
pub struct LaunchSpec {
    pub(crate) mode: ConfinementMode,
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) current_dir: PathBuf,
    pub(crate) env: Vec<(OsString, OsString)>,
    pub(crate) rlimits: Option<ResourceLimits>,
    pub(crate) cgroup: Option<CgroupSlot>,
}

impl LaunchSpec {
    pub fn mode(&self) -> ConfinementMode {
        self.mode
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn rlimits(&self) -> Option<ResourceLimits> {
        self.rlimits
    }

    pub fn cgroup(&self) -> Option<&CgroupSlot> {
        self.cgroup.as_ref()
    }

    /// Build the command for this launch.
    ///
    /// The child gets a cleared environment, a null stdin, its own process
    /// group (group id = child pid) and is killed if the handle is dropped.
    /// Callers configure stdout/stderr.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.current_dir)
            .env_clear()
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);

        let rlimits = self.rlimits;
        let cgroup_fd = self.cgroup.as_ref().map(CgroupSlot::procs_fd);
        if rlimits.is_some() || cgroup_fd.is_some() {
            // SAFETY: the closure only issues write(2) and setrlimit(2), both
            // async-signal-safe, and does not allocate.
            unsafe {
                command.pre_exec(move || {
                    if let Some(fd) = cgroup_fd {
                        join_cgroup(fd)?;
                    }
                    if let Some(limits) = rlimits {
                        apply_rlimits(limits)?;
                    }
                    Ok(())
                });
            }
        }

        command
    }

    /// Render the launch as a single shell-like line for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            line.push(' ');
            if arg.is_empty() || arg.contains(' ') || arg.contains('\'') || arg.contains('"') {
                line.push('\'');
                line.push_str(&arg.replace('\'', "'\\''"));
                line.push('\'');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

fn join_cgroup(fd: std::os::unix::io::RawFd) -> io::Result<()> {
    // "0" moves the writing process itself into the cgroup.
    let written = unsafe { libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// RLIMIT_NPROC counts every process of the real uid, so it is left alone;
// the launch cgroup carries the process ceiling.
fn apply_rlimits(limits: ResourceLimits) -> io::Result<()> {
    let memory = rlimit(limits.memory_bytes);
    let core = rlimit(0);
    unsafe {
        if libc::setrlimit(libc::RLIMIT_AS, &memory) != 0
            || libc::setrlimit(libc::RLIMIT_CORE, &core) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn rlimit(value: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    }
}
