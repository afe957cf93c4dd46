use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use confinement::{Confiner, ConfinementError, Invocation, LaunchSpec};
use session_registry::{
    kill_process_group, RegistryError, SessionHandle, SessionKey, SessionKind, SessionRegistry,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use crate::framing::DEFAULT_MAX_FRAME_BYTES;

/// Time a language server gets to exit on its own once its input closes.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const MAX_STDERR_LINE: u64 = 4 * 1024;

/// The language server every bridge session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub max_frame_bytes: usize,
}

impl CompanionSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if !self.program.is_absolute() {
            return Err(BridgeError::InvalidConfig {
                message: format!(
                    "language server path '{}' must be absolute",
                    self.program.display()
                ),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(BridgeError::InvalidConfig {
                message: "maximum frame size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid bridge config: {message}")]
    InvalidConfig { message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Confinement(#[from] ConfinementError),

    #[error("Failed to spawn language server {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Language server has no {stream} pipe")]
    MissingPipe { stream: &'static str },
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidConfig { .. } => "BRIDGE_INVALID_CONFIG",
            BridgeError::Registry(err) => err.code(),
            BridgeError::Confinement(err) => err.code(),
            BridgeError::Spawn { .. } => "BRIDGE_SPAWN_FAILED",
            BridgeError::MissingPipe { .. } => "BRIDGE_MISSING_PIPE",
        }
    }
}

/// Starts one confined language server per bridge session.
#[derive(Debug, Clone)]
pub struct CompanionLauncher {
    confiner: Arc<dyn Confiner>,
    registry: SessionRegistry,
    spec: Arc<CompanionSpec>,
}

impl CompanionLauncher {
    pub fn new(confiner: Arc<dyn Confiner>, registry: SessionRegistry, spec: CompanionSpec) -> Self {
        Self {
            confiner,
            registry,
            spec: Arc::new(spec),
        }
    }

    pub fn spec(&self) -> &CompanionSpec {
        &self.spec
    }

    /// Open a registry session and spawn the language server inside it.
    pub fn launch(&self) -> Result<Companion, BridgeError> {
        let session = self.registry.open(SessionKind::Bridge)?;
        let invocation = Invocation::new(&self.spec.program, session.workspace())
            .args(self.spec.args.iter().cloned())
            .label(session.key().to_string());
        let launch = self.confiner.launch_spec(&invocation)?;

        let mut command = launch.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
            program: self.spec.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            session.attach_process(pid)?;
        }
        let stdin = child
            .stdin
            .take()
            .ok_or(BridgeError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(BridgeError::MissingPipe { stream: "stdout" })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(session.key(), stderr));
        }

        debug!(
            session = %session.key(),
            pid = ?pid,
            mode = launch.mode().as_str(),
            "language server started"
        );
        Ok(Companion {
            stdin,
            stdout,
            process: CompanionProcess {
                child,
                pid,
                launch,
                session,
            },
        })
    }
}

/// A running language server and its pipes.
#[derive(Debug)]
pub struct Companion {
    stdin: ChildStdin,
    stdout: ChildStdout,
    process: CompanionProcess,
}

impl Companion {
    pub fn key(&self) -> SessionKey {
        self.process.key()
    }

    pub fn into_parts(self) -> (ChildStdout, ChildStdin, CompanionProcess) {
        (self.stdout, self.stdin, self.process)
    }
}

/// Lifetime owner of a language server process. Dropping it kills the
/// process and closes its session; [`CompanionProcess::shutdown`] does the
/// same after giving the server a chance to exit.
#[derive(Debug)]
pub struct CompanionProcess {
    child: Child,
    pid: Option<u32>,
    // Dropped after the child is reaped: removes the cgroup.
    launch: LaunchSpec,
    session: SessionHandle,
}

impl CompanionProcess {
    pub fn key(&self) -> SessionKey {
        self.session.key()
    }

    /// Reap the server, kill anything left in its process group and release
    /// its workspace. Call after its stdin has been closed.
    pub async fn shutdown(mut self) {
        let key = self.session.key();
        let exited = tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await;

        if let Some(pid) = self.pid {
            if let Err(err) = kill_process_group(pid as i32) {
                warn!(session = %key, pid, error = %err, "failed to kill language server group");
            }
        }

        match exited {
            Ok(Ok(status)) => debug!(session = %key, status = %status, "language server exited"),
            Ok(Err(err)) => warn!(session = %key, error = %err, "failed to wait for language server"),
            Err(_) => {
                let _ = self.child.start_kill();
                match self.child.wait().await {
                    Ok(status) => debug!(session = %key, status = %status, "language server killed"),
                    Err(err) => warn!(session = %key, error = %err, "failed to reap language server"),
                }
            }
        }

        self.session.detach_process();
        drop(self.launch);
        self.session.close_async().await;
    }
}

async fn log_stderr<R>(key: SessionKey, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match (&mut reader).take(MAX_STDERR_LINE).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(session = %key, line = %text.trim_end(), "language server stderr");
            }
            Err(err) => {
                debug!(session = %key, error = %err, "language server stderr closed");
                break;
            }
        }
    }
}
