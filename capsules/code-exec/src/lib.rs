//! Execution of untrusted programs.
//!
//! [`Executor::execute`] takes submitted source code, writes it into a fresh
//! registry workspace, launches the configured interpreter over it through a
//! [`Confiner`], and reports a single [`ExecutionResult`]. Time, output and
//! code-size limits come from [`ExecLimits`]; memory and process ceilings are
//! the confiner's job.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use confinement::{Confiner, ConfinementError, Invocation};
use serde::{Deserialize, Serialize, Serializer};
use session_registry::{kill_process_group, RegistryError, SessionHandle, SessionKind, SessionRegistry};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod capture;

pub use capture::CappedBuffer;

use capture::spawn_drain;

pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_CODE_BYTES: usize = 100 * 1024;

/// How long output pipes may stay open after the process group is gone.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Per-execution limits, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub time_limit: Duration,
    pub output_cap_bytes: usize,
    pub max_code_bytes: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            time_limit: DEFAULT_TIME_LIMIT,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
        }
    }
}

impl ExecLimits {
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.time_limit.is_zero() {
            return Err(ExecError::InvalidConfig {
                message: "time limit must be greater than zero".to_string(),
            });
        }
        if self.output_cap_bytes == 0 {
            return Err(ExecError::InvalidConfig {
                message: "output cap must be greater than zero".to_string(),
            });
        }
        if self.max_code_bytes == 0 {
            return Err(ExecError::InvalidConfig {
                message: "maximum code size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// The interpreter every submission is run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSpec {
    pub program: PathBuf,
    /// Flags placed before the script name, typically the interpreter's
    /// restricted-mode switch.
    pub restricted_args: Vec<String>,
    /// File name the submitted code is written to inside the workspace.
    pub script_name: String,
}

impl InterpreterSpec {
    pub fn validate(&self) -> Result<(), ExecError> {
        if !self.program.is_absolute() {
            return Err(ExecError::InvalidConfig {
                message: format!(
                    "interpreter path '{}' must be absolute",
                    self.program.display()
                ),
            });
        }

        let mut components = Path::new(&self.script_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(()),
            _ => Err(ExecError::InvalidConfig {
                message: format!(
                    "script name '{}' must be a plain file name",
                    self.script_name
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
}

/// Outcome of one execution. Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn outcome(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.success {
            "success"
        } else {
            "failure"
        }
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Submitted code is {size} bytes; the limit is {limit} bytes")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("Invalid execution config: {message}")]
    InvalidConfig { message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to write program to {path}: {source}")]
    WriteProgram {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Confinement(#[from] ConfinementError),
}

impl ExecError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::CodeTooLarge { .. } => "EXEC_CODE_TOO_LARGE",
            ExecError::InvalidConfig { .. } => "EXEC_INVALID_CONFIG",
            ExecError::Registry(err) => err.code(),
            ExecError::WriteProgram { .. } => "EXEC_WRITE_FAILED",
            ExecError::Confinement(err) => err.code(),
        }
    }

    /// True for input the caller must fix, as opposed to server-side failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ExecError::CodeTooLarge { .. })
    }
}

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

/// Runs submissions. Cheap to clone; executions are independent of each
/// other and may run concurrently.
#[derive(Debug, Clone)]
pub struct Executor {
    confiner: Arc<dyn Confiner>,
    registry: SessionRegistry,
    interpreter: Arc<InterpreterSpec>,
    limits: ExecLimits,
}

impl Executor {
    pub fn new(
        confiner: Arc<dyn Confiner>,
        registry: SessionRegistry,
        interpreter: InterpreterSpec,
        limits: ExecLimits,
    ) -> Self {
        Self {
            confiner,
            registry,
            interpreter: Arc::new(interpreter),
            limits,
        }
    }

    pub fn limits(&self) -> ExecLimits {
        self.limits
    }

    /// Run `request` to completion.
    ///
    /// Oversized code is rejected before anything is created on disk. A
    /// program that fails, times out or floods its output still yields `Ok`;
    /// `Err` is reserved for rejected input and server-side failures. The
    /// workspace is gone by the time this returns, on every path.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let size = request.code.len();
        if size > self.limits.max_code_bytes {
            return Err(ExecError::CodeTooLarge {
                size,
                limit: self.limits.max_code_bytes,
            });
        }

        let session = self.registry.open(SessionKind::Execution)?;
        let result = self.run(&session, request).await;
        match &result {
            Ok(result) => info!(
                session = %session.key(),
                outcome = result.outcome(),
                exit_code = ?result.exit_code,
                duration_ms = result.execution_time_ms,
                truncated = result.truncated,
                "execution finished"
            ),
            Err(err) => warn!(session = %session.key(), error = %err, "execution failed"),
        }
        session.close_async().await;
        result
    }

    async fn run(
        &self,
        session: &SessionHandle,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        write_program(
            &session.workspace().join(&self.interpreter.script_name),
            request.code.as_bytes(),
        )?;

        let invocation = Invocation::new(&self.interpreter.program, session.workspace())
            .args(self.interpreter.restricted_args.iter().cloned())
            .arg(self.interpreter.script_name.clone())
            .label(session.key().to_string());
        let launch = self.confiner.launch_spec(&invocation)?;

        let mut command = launch.command();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    session = %session.key(),
                    program = %launch.program().display(),
                    error = %err,
                    "failed to spawn program"
                );
                let note = format!("failed to start {}: {}\n", launch.program().display(), err);
                let (stderr, truncated) = with_note(Vec::new(), &note, self.limits.output_cap_bytes);
                return Ok(ExecutionResult {
                    success: false,
                    stdout: Vec::new(),
                    stderr,
                    exit_code: None,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                    truncated,
                });
            }
        };
        let pid = child.id();
        debug!(
            session = %session.key(),
            pid = ?pid,
            mode = launch.mode().as_str(),
            "execution started"
        );
        if let Some(pid) = pid {
            session.attach_process(pid)?;
        }

        let cap = self.limits.output_cap_bytes;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut stdout_task = spawn_drain(child.stdout.take(), cap, stop_rx.clone());
        let mut stderr_task = spawn_drain(child.stderr.take(), cap, stop_rx);

        // Exactly one branch wins; the other is dropped unpolled.
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(err) => Outcome::WaitFailed(err),
            },
            _ = tokio::time::sleep(self.limits.time_limit) => Outcome::TimedOut,
        };
        let elapsed = started.elapsed();

        // Reclaim the whole group on every outcome, so background children
        // of the program never outlive the request.
        if let Some(pid) = pid {
            if let Err(err) = kill_process_group(pid as i32) {
                warn!(session = %session.key(), pid, error = %err, "failed to kill process group");
            }
        }

        let timed_out = matches!(outcome, Outcome::TimedOut);
        let mut wait_error = None;
        let status = match outcome {
            Outcome::Exited(status) => Some(status),
            Outcome::WaitFailed(err) => {
                let _ = child.start_kill();
                wait_error = Some(err);
                None
            }
            Outcome::TimedOut => {
                warn!(
                    session = %session.key(),
                    limit_ms = self.limits.time_limit.as_millis() as u64,
                    "execution timed out; process group killed"
                );
                let _ = child.start_kill();
                if let Err(err) = child.wait().await {
                    wait_error = Some(err);
                }
                None
            }
        };
        session.detach_process();

        let joined = tokio::time::timeout(OUTPUT_GRACE, async {
            tokio::join!(&mut stdout_task, &mut stderr_task)
        })
        .await;
        let (stdout, stderr) = match joined {
            Ok(results) => results,
            Err(_) => {
                debug!(session = %session.key(), "output pipes still open after kill; stopping drains");
                let _ = stop_tx.send(true);
                tokio::join!(stdout_task, stderr_task)
            }
        };
        let (stdout, stdout_truncated) = take_capture(stdout, cap);
        let (mut stderr, mut stderr_truncated) = take_capture(stderr, cap);
        if let Some(err) = &wait_error {
            warn!(session = %session.key(), error = %err, "failed to wait for program");
            let (noted, noted_truncated) =
                with_note(stderr, &format!("failed to wait for program: {}\n", err), cap);
            stderr = noted;
            stderr_truncated |= noted_truncated;
        }

        if let Some(cgroup) = launch.cgroup() {
            let kills = cgroup.oom_kills();
            if kills > 0 {
                warn!(session = %session.key(), oom_kills = kills, "execution hit its memory ceiling");
            }
        }
        drop(launch);

        let exit_code = status.as_ref().and_then(exit_code);
        Ok(ExecutionResult {
            success: !timed_out && wait_error.is_none() && exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            execution_time_ms: elapsed.as_millis() as u64,
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

fn write_program(path: &Path, code: &[u8]) -> Result<(), ExecError> {
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(code)?;
        file.sync_all()
    };
    write().map_err(|source| ExecError::WriteProgram {
        path: path.to_path_buf(),
        source,
    })
}

fn take_capture(
    joined: Result<CappedBuffer, tokio::task::JoinError>,
    cap: usize,
) -> (Vec<u8>, bool) {
    match joined {
        Ok(buffer) => buffer.into_parts(),
        Err(err) => {
            warn!(error = %err, "output drain task failed");
            CappedBuffer::new(cap).into_parts()
        }
    }
}

/// Append a server-side note to captured stderr, within the output cap.
fn with_note(stderr: Vec<u8>, note: &str, cap: usize) -> (Vec<u8>, bool) {
    let mut buffer = CappedBuffer::new(cap);
    buffer.push(&stderr);
    buffer.push(note.as_bytes());
    buffer.into_parts()
}

/// Exit code of a normally terminated process; `None` when killed by a signal.
fn exit_code(status: &ExitStatus) -> Option<i32> {
    status.code()
}
