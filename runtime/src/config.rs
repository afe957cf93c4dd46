//! Service configuration, read once from flags and environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use capsules_code_exec::{ExecLimits, InterpreterSpec};
use capsules_lsp_bridge::CompanionSpec;
use clap::{ArgAction, Parser};
use confinement::SandboxConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "codebox")]
#[command(about = "Runs untrusted programs and language servers inside a sandbox")]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Confine untrusted processes in namespaces; `false` runs them directly
    #[arg(long, env = "SANDBOX_SECURE_MODE", default_value_t = true, action = ArgAction::Set)]
    pub secure_mode: bool,

    /// Path to the bubblewrap binary (default: `bwrap` on PATH)
    #[arg(long, env = "SANDBOX_CONFINEMENT_TOOL")]
    pub confinement_tool: Option<PathBuf>,

    /// Address-space ceiling per process, in megabytes
    #[arg(long, env = "SANDBOX_MEMORY_LIMIT_MB", default_value_t = confinement::DEFAULT_MEMORY_LIMIT_MB)]
    pub memory_limit_mb: u64,

    /// Process and thread ceiling per launch
    #[arg(long, env = "SANDBOX_PIDS_MAX", default_value_t = confinement::DEFAULT_PIDS_MAX)]
    pub pids_max: u64,

    /// Give confined processes no network interfaces
    #[arg(long, env = "SANDBOX_NETWORK_ISOLATED", default_value_t = true, action = ArgAction::Set)]
    pub network_isolated: bool,

    /// Delegated cgroup v2 directory for per-launch cgroups
    #[arg(long, env = "SANDBOX_CGROUP_PARENT")]
    pub cgroup_parent: Option<PathBuf>,

    /// Extra host paths bound read-only inside the sandbox
    #[arg(
        long = "extra-ro-path",
        env = "SANDBOX_EXTRA_RO_PATHS",
        value_delimiter = ','
    )]
    pub extra_ro_paths: Vec<PathBuf>,

    /// Wall-clock limit per execution, in milliseconds
    #[arg(long, env = "EXEC_TIME_LIMIT_MS", default_value_t = 5_000)]
    pub time_limit_ms: u64,

    /// Bytes kept from each of stdout and stderr
    #[arg(long, env = "EXEC_OUTPUT_CAP_BYTES", default_value_t = capsules_code_exec::DEFAULT_OUTPUT_CAP_BYTES)]
    pub output_cap_bytes: usize,

    /// Largest accepted submission, in bytes
    #[arg(long, env = "EXEC_MAX_CODE_BYTES", default_value_t = capsules_code_exec::DEFAULT_MAX_CODE_BYTES)]
    pub max_code_bytes: usize,

    /// Interpreter that runs submissions
    #[arg(long = "interpreter", env = "INTERPRETER_PATH")]
    pub interpreter_path: PathBuf,

    /// Interpreter flags placed before the script, space separated
    #[arg(
        long,
        env = "INTERPRETER_ARGS",
        default_value = "--restricted",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub interpreter_args: Vec<String>,

    /// File name submissions are written to
    #[arg(long = "script-name", env = "INTERPRETER_SCRIPT_NAME", default_value = "main.src")]
    pub script_name: String,

    /// Language server for the bridge; the bridge is disabled when unset
    #[arg(long = "language-server", env = "LANGUAGE_SERVER_PATH")]
    pub language_server_path: Option<PathBuf>,

    /// Language server arguments, space separated
    #[arg(
        long,
        env = "LANGUAGE_SERVER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub language_server_args: Vec<String>,

    /// Largest frame accepted from the language server
    #[arg(long, env = "BRIDGE_MAX_FRAME_BYTES", default_value_t = capsules_lsp_bridge::DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Directory holding per-session workspaces (default: <tmp>/codebox)
    #[arg(long, env = "SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            secure_mode: self.secure_mode,
            memory_limit_mb: self.memory_limit_mb,
            pids_max: self.pids_max,
            confinement_tool_path: self.confinement_tool.clone(),
            network_isolated: self.network_isolated,
            cgroup_parent: self.cgroup_parent.clone(),
            extra_ro_paths: self.extra_ro_paths.clone(),
        }
    }

    pub fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            time_limit: Duration::from_millis(self.time_limit_ms),
            output_cap_bytes: self.output_cap_bytes,
            max_code_bytes: self.max_code_bytes,
        }
    }

    pub fn interpreter_spec(&self) -> InterpreterSpec {
        InterpreterSpec {
            program: self.interpreter_path.clone(),
            restricted_args: non_empty(&self.interpreter_args),
            script_name: self.script_name.clone(),
        }
    }

    pub fn companion_spec(&self) -> Option<CompanionSpec> {
        self.language_server_path.as_ref().map(|program| CompanionSpec {
            program: program.clone(),
            args: non_empty(&self.language_server_args),
            max_frame_bytes: self.max_frame_bytes,
        })
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("codebox"))
    }

    /// Reject settings the components would refuse later.
    pub fn validate(&self) -> Result<()> {
        self.sandbox_config()
            .validate()
            .context("invalid sandbox settings")?;
        self.exec_limits()
            .validate()
            .context("invalid execution limits")?;
        self.interpreter_spec()
            .validate()
            .context("invalid interpreter settings")?;
        if let Some(companion) = self.companion_spec() {
            companion
                .validate()
                .context("invalid language server settings")?;
        }
        Ok(())
    }
}

// Delimited env values such as "" or "a  b" leave empty entries behind.
fn non_empty(args: &[String]) -> Vec<String> {
    args.iter().filter(|arg| !arg.is_empty()).cloned().collect()
}
