use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cgroup::CgroupSlot;
use crate::config::{ResourceLimits, SandboxConfig};
use crate::spec::{ConfinementMode, Invocation, LaunchSpec};
use crate::{base_env, check_workspace, Confiner, ConfinementError};

pub const DEFAULT_TOOL: &str = "bwrap";

/// Mount point of the scratch workspace inside the sandbox.
pub const SANDBOX_WORKDIR: &str = "/workspace";

const HOST_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// `f_type` reported by statfs(2) for a cgroup v2 mount.
const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

/// Secure-mode confiner backed by bubblewrap.
///
/// Each launch gets private user, PID, IPC, UTS and (optionally) network
/// namespaces, a read-only view of the host root with the workspace bound
/// read-write at [`SANDBOX_WORKDIR`], and an address-space rlimit. Each
/// launch also runs in its own cgroup under the configured parent, which
/// holds the memory and process ceilings for that launch alone.
#[derive(Debug, Clone)]
pub struct BubblewrapConfiner {
    tool: PathBuf,
    limits: ResourceLimits,
    network_isolated: bool,
    cgroup_parent: PathBuf,
    extra_ro_paths: Vec<PathBuf>,
}

impl BubblewrapConfiner {
    /// Resolve the confinement tool and capture the limits. Fails closed when
    /// the tool cannot be found or is not executable, or when the cgroup
    /// parent is missing or not on a cgroup v2 filesystem.
    pub fn new(config: &SandboxConfig) -> Result<Self, ConfinementError> {
        Self::build(config, verify_cgroup2)
    }

    pub(crate) fn build(
        config: &SandboxConfig,
        verify_parent: fn(&Path) -> Result<(), ConfinementError>,
    ) -> Result<Self, ConfinementError> {
        let tool = match &config.confinement_tool_path {
            Some(path) => path.clone(),
            None => find_on_path(DEFAULT_TOOL).ok_or_else(|| ConfinementError::ToolUnavailable {
                tool: DEFAULT_TOOL.to_string(),
                reason: "not found on PATH".to_string(),
            })?,
        };
        ensure_executable(&tool)?;

        let cgroup_parent = config.cgroup_parent.clone().ok_or_else(|| {
            ConfinementError::InvalidConfig {
                message: "secure mode requires a cgroup parent".to_string(),
            }
        })?;
        verify_parent(&cgroup_parent)?;

        Ok(Self {
            tool,
            limits: config.limits(),
            network_isolated: config.network_isolated,
            cgroup_parent,
            extra_ro_paths: config.extra_ro_paths.clone(),
        })
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    pub fn cgroup_parent(&self) -> &Path {
        &self.cgroup_parent
    }

    fn namespace_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--unshare-user",
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-cgroup-try",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        if self.network_isolated {
            args.push("--unshare-net".into());
        }
        args
    }

    fn build_args(&self, invocation: &Invocation) -> Vec<OsString> {
        let mut args = self.namespace_args();
        for flag in ["--die-with-parent", "--new-session"] {
            args.push(flag.into());
        }
        args.extend(["--cap-drop", "ALL"].map(OsString::from));

        args.extend(["--ro-bind", "/", "/"].map(OsString::from));
        for path in &self.extra_ro_paths {
            args.push("--ro-bind".into());
            args.push(path.clone().into_os_string());
            args.push(path.clone().into_os_string());
        }
        args.extend(["--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp"].map(OsString::from));

        args.push("--bind".into());
        args.push(invocation.workspace.clone().into_os_string());
        args.push(SANDBOX_WORKDIR.into());
        args.extend(["--chdir", SANDBOX_WORKDIR].map(OsString::from));

        args.push("--".into());
        args.push(invocation.program.clone().into_os_string());
        args.extend(invocation.args.iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl Confiner for BubblewrapConfiner {
    fn mode(&self) -> ConfinementMode {
        ConfinementMode::Confined
    }

    fn launch_spec(&self, invocation: &Invocation) -> Result<LaunchSpec, ConfinementError> {
        // The tool may disappear after startup; never fall through to an
        // unconfined launch when it does.
        ensure_executable(&self.tool)?;
        check_workspace(&invocation.workspace)?;

        check_label(&invocation.label)?;
        let cgroup = CgroupSlot::create(&self.cgroup_parent, &invocation.label, self.limits)?;

        let mut env = base_env(Path::new(SANDBOX_WORKDIR));
        env.extend(
            invocation
                .env
                .iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        );

        let spec = LaunchSpec {
            mode: ConfinementMode::Confined,
            program: self.tool.clone(),
            args: self.build_args(invocation),
            current_dir: invocation.workspace.clone(),
            env,
            rlimits: Some(self.limits),
            cgroup: Some(cgroup),
        };
        debug!(label = %invocation.label, command = %spec.command_line(), "built confined launch");
        Ok(spec)
    }

    /// Start a trivial program in fresh namespaces and a fresh launch cgroup,
    /// so a parent without a writable `pids.max` fails at startup.
    async fn check_host(&self) -> Result<(), ConfinementError> {
        let cgroup = CgroupSlot::create(
            &self.cgroup_parent,
            &format!("startup-check-{}", std::process::id()),
            self.limits,
        )?;
        let mut args = self.namespace_args();
        args.extend(
            ["--die-with-parent", "--ro-bind", "/", "/", "--proc", "/proc"]
                .into_iter()
                .chain(["--dev", "/dev", "--", "true"])
                .map(OsString::from),
        );
        let check = LaunchSpec {
            mode: ConfinementMode::Confined,
            program: self.tool.clone(),
            args,
            current_dir: PathBuf::from("/"),
            env: base_env(Path::new("/")),
            rlimits: None,
            cgroup: Some(cgroup),
        };
        let mut command = check.command();
        command.stdout(Stdio::null()).stderr(Stdio::piped());

        let tool = self.tool.display().to_string();
        let output = tokio::time::timeout(HOST_CHECK_TIMEOUT, command.output())
            .await
            .map_err(|_| ConfinementError::NamespaceUnavailable {
                tool: tool.clone(),
                stderr: format!("host check did not finish within {:?}", HOST_CHECK_TIMEOUT),
            })?
            .map_err(|err| ConfinementError::ToolUnavailable {
                tool: tool.clone(),
                reason: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(ConfinementError::NamespaceUnavailable {
                tool,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(
            tool = %tool,
            cgroup_parent = %self.cgroup_parent.display(),
            network_isolated = self.network_isolated,
            "confinement check succeeded"
        );
        Ok(())
    }
}

fn check_label(label: &str) -> Result<(), ConfinementError> {
    if label.is_empty() || label == "." || label == ".." || label.contains('/') {
        return Err(ConfinementError::InvalidConfig {
            message: format!("launch label '{}' is not a valid cgroup name", label),
        });
    }
    Ok(())
}

fn verify_cgroup2(path: &Path) -> Result<(), ConfinementError> {
    let c_path =
        CString::new(path.as_os_str().as_bytes()).map_err(|_| ConfinementError::InvalidConfig {
            message: format!("cgroup parent '{}' contains a NUL byte", path.display()),
        })?;
    // SAFETY: statfs only writes into the zeroed struct we own.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(ConfinementError::Cgroup {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    // f_type's width differs between libc targets.
    #[allow(clippy::unnecessary_cast)]
    let fs_type = stat.f_type as i64;
    if fs_type != CGROUP2_SUPER_MAGIC {
        return Err(ConfinementError::InvalidConfig {
            message: format!("cgroup parent '{}' is not a cgroup v2 directory", path.display()),
        });
    }
    Ok(())
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| ensure_executable(candidate).is_ok())
}

fn ensure_executable(path: &Path) -> Result<(), ConfinementError> {
    let unavailable = |reason: String| ConfinementError::ToolUnavailable {
        tool: path.display().to_string(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|err| unavailable(err.to_string()))?;
    if !metadata.is_file() {
        return Err(unavailable("not a regular file".to_string()));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(unavailable("not executable".to_string()));
    }
    Ok(())
}
