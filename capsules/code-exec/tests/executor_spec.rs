//! Execution lifecycle specs.
//!
//! These run `/bin/sh` as the interpreter under the direct confiner so they
//! need no namespace support on the test host.

use anyhow::Result;
use async_trait::async_trait;
use capsules_code_exec::{ExecError, ExecLimits, ExecutionRequest, Executor, InterpreterSpec};
use confinement::{
    Confiner, ConfinementError, ConfinementMode, DirectConfiner, Invocation, LaunchSpec,
};
use session_registry::SessionRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Harness {
    _root: TempDir,
    scratch: PathBuf,
    executor: Executor,
}

impl Harness {
    fn new(limits: ExecLimits) -> Self {
        Self::with_confiner(Arc::new(DirectConfiner::new()), "/bin/sh", limits)
    }

    fn with_confiner(confiner: Arc<dyn Confiner>, interpreter: &str, limits: ExecLimits) -> Self {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("scratch");
        let registry = SessionRegistry::new(&scratch).unwrap();
        let executor = Executor::new(
            confiner,
            registry,
            InterpreterSpec {
                program: PathBuf::from(interpreter),
                restricted_args: vec![],
                script_name: "main.sh".to_string(),
            },
            limits,
        );
        Self {
            _root: root,
            scratch,
            executor,
        }
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.scratch).unwrap().count()
    }
}

fn request(code: &str) -> ExecutionRequest {
    ExecutionRequest {
        code: code.to_string(),
    }
}

fn limits() -> ExecLimits {
    ExecLimits {
        time_limit: Duration::from_secs(10),
        ..Default::default()
    }
}

/// A pid is gone once it has no /proc entry or is a zombie awaiting its new
/// parent's reap.
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..50 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    process_gone(pid)
}

#[tokio::test]
async fn given_simple_program_when_execute_then_captures_stdout() -> Result<()> {
    // Arrange
    let harness = Harness::new(limits());

    // Act
    let result = harness.executor.execute(&request("echo hello")).await?;

    // Assert
    assert!(result.success);
    assert_eq!(result.stdout, b"hello\n");
    assert!(result.stderr.is_empty());
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.timed_out);
    assert!(!result.truncated);
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_empty_code_when_execute_then_succeeds_with_no_output() -> Result<()> {
    let harness = Harness::new(limits());

    let result = harness.executor.execute(&request("")).await?;

    assert!(result.success);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.is_empty());
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_nonzero_exit_when_execute_then_reports_failure_not_error() -> Result<()> {
    let harness = Harness::new(limits());

    let result = harness
        .executor
        .execute(&request("echo partial; echo oops >&2; exit 3"))
        .await?;

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout, b"partial\n");
    assert_eq!(result.stderr, b"oops\n");
    assert!(!result.timed_out);
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_long_sleep_when_execute_then_times_out_and_kills_process_group() -> Result<()> {
    // Arrange: the program reports its own pid and a background child's pid
    // before both block far beyond the limit.
    let harness = Harness::new(ExecLimits {
        time_limit: Duration::from_millis(500),
        ..Default::default()
    });
    let started = Instant::now();

    // Act
    let result = harness
        .executor
        .execute(&request("echo $$; sleep 30 & echo $!; sleep 30"))
        .await?;

    // Assert
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out);
    assert!(!result.success);
    assert_eq!(result.exit_code, None);
    assert!(result.execution_time_ms >= 500);

    let stdout = String::from_utf8(result.stdout.clone())?;
    let pids: Vec<u32> = stdout
        .lines()
        .map(|line| line.trim().parse())
        .collect::<Result<_, _>>()?;
    assert_eq!(pids.len(), 2, "unexpected stdout: {stdout:?}");
    for pid in pids {
        assert!(wait_until_gone(pid).await, "pid {pid} survived the timeout");
    }
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_background_child_when_program_exits_then_child_is_reclaimed() -> Result<()> {
    let harness = Harness::new(limits());

    let result = harness
        .executor
        .execute(&request("sleep 30 >/dev/null 2>&1 & echo $!"))
        .await?;

    assert!(result.success);
    let pid: u32 = String::from_utf8(result.stdout)?.trim().parse()?;
    assert!(wait_until_gone(pid).await);

    Ok(())
}

#[tokio::test]
async fn given_output_beyond_cap_when_execute_then_truncates_both_streams() -> Result<()> {
    let harness = Harness::new(ExecLimits {
        output_cap_bytes: 1000,
        ..limits()
    });

    let result = harness
        .executor
        .execute(&request(
            "head -c 5000 /dev/zero | tr '\\000' a; head -c 5000 /dev/zero | tr '\\000' b >&2",
        ))
        .await?;

    assert!(result.success);
    assert!(result.truncated);
    assert_eq!(result.stdout, vec![b'a'; 1000]);
    assert_eq!(result.stderr, vec![b'b'; 1000]);

    Ok(())
}

#[tokio::test]
async fn given_output_far_beyond_pipe_capacity_when_execute_then_program_still_finishes(
) -> Result<()> {
    // Two megabytes fill the pipe many times over; the run completes only if
    // draining continues after the cap.
    let harness = Harness::new(ExecLimits {
        output_cap_bytes: 16,
        ..limits()
    });

    let result = harness
        .executor
        .execute(&request("head -c 2097152 /dev/zero"))
        .await?;

    assert!(!result.timed_out);
    assert!(result.success);
    assert!(result.truncated);
    assert_eq!(result.stdout.len(), 16);

    Ok(())
}

#[tokio::test]
async fn given_exact_cap_output_when_execute_then_not_truncated() -> Result<()> {
    let harness = Harness::new(ExecLimits {
        output_cap_bytes: 6,
        ..limits()
    });

    let result = harness.executor.execute(&request("echo hello")).await?;

    assert_eq!(result.stdout, b"hello\n");
    assert!(!result.truncated);

    Ok(())
}

#[tokio::test]
async fn given_oversized_code_when_execute_then_rejects_before_spawning() -> Result<()> {
    // Arrange: with an interpreter that cannot exist, any launch attempt
    // would come back as a failed result rather than a rejection.
    let harness = Harness::with_confiner(
        Arc::new(DirectConfiner::new()),
        "/nonexistent/interpreter",
        ExecLimits {
            max_code_bytes: 100 * 1024,
            ..limits()
        },
    );
    let code = "x".repeat(200 * 1024);

    // Act
    let err = harness.executor.execute(&request(&code)).await.unwrap_err();

    // Assert
    assert!(matches!(err, ExecError::CodeTooLarge { size, limit } if size == 200 * 1024 && limit == 100 * 1024));
    assert!(err.is_rejection());
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_missing_interpreter_when_execute_then_failed_result_and_no_workspace() -> Result<()> {
    // Arrange
    let harness = Harness::with_confiner(
        Arc::new(DirectConfiner::new()),
        "/nonexistent/interpreter",
        limits(),
    );

    // Act
    let result = harness.executor.execute(&request("echo hi")).await?;

    // Assert
    assert!(!result.success);
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.stdout.is_empty());
    let stderr = String::from_utf8(result.stderr)?;
    assert!(stderr.contains("failed to start /nonexistent/interpreter"), "stderr: {}", stderr);
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_multibyte_output_beyond_cap_when_execute_then_cut_on_character_boundary(
) -> Result<()> {
    // Arrange: 600 two-byte characters against an odd cap.
    let harness = Harness::new(ExecLimits {
        output_cap_bytes: 1001,
        ..limits()
    });
    let code = "i=0; while [ $i -lt 600 ]; do printf '\\303\\251'; i=$((i+1)); done";

    // Act
    let result = harness.executor.execute(&request(code)).await?;

    // Assert
    assert!(result.truncated);
    assert_eq!(result.stdout.len(), 1000);
    assert!(std::str::from_utf8(&result.stdout).is_ok());
    let body = serde_json::to_value(&result)?;
    let stdout = body["stdout"].as_str().unwrap_or_default();
    assert_eq!(stdout.chars().count(), 500);
    assert!(!stdout.contains('\u{FFFD}'));

    Ok(())
}

#[derive(Debug)]
struct RefusingConfiner;

#[async_trait]
impl Confiner for RefusingConfiner {
    fn mode(&self) -> ConfinementMode {
        ConfinementMode::Confined
    }

    fn launch_spec(&self, _invocation: &Invocation) -> Result<LaunchSpec, ConfinementError> {
        Err(ConfinementError::ToolUnavailable {
            tool: "bwrap".to_string(),
            reason: "removed".to_string(),
        })
    }
}

#[tokio::test]
async fn given_confinement_refused_when_execute_then_server_error_without_fallback() -> Result<()> {
    let harness = Harness::with_confiner(Arc::new(RefusingConfiner), "/bin/sh", limits());

    let err = harness.executor.execute(&request("echo hi")).await.unwrap_err();

    assert!(matches!(err, ExecError::Confinement(_)));
    assert_eq!(err.code(), "CONFINEMENT_TOOL_UNAVAILABLE");
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_concurrent_executions_when_run_together_then_workspaces_are_isolated() -> Result<()> {
    // Arrange
    let harness = Harness::new(limits());
    let first = harness.executor.clone();
    let second = harness.executor.clone();

    // Act: each run drops a marker, waits for the other to do the same, then
    // lists its own workspace.
    let (left, right) = tokio::join!(
        async move {
            first
                .execute(&request("echo left > marker_left; sleep 0.2; ls"))
                .await
        },
        async move {
            second
                .execute(&request("echo right > marker_right; sleep 0.2; ls"))
                .await
        },
    );

    // Assert
    assert_eq!(left?.stdout, b"main.sh\nmarker_left\n");
    assert_eq!(right?.stdout, b"main.sh\nmarker_right\n");
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_program_when_execute_then_runs_in_its_workspace_with_cleared_env() -> Result<()> {
    let harness = Harness::new(limits());

    let result = harness
        .executor
        .execute(&request("test \"$HOME\" = \"$(pwd)\" && echo ${CARGO:-clean}"))
        .await?;

    assert!(result.success, "stderr: {:?}", String::from_utf8_lossy(&result.stderr));
    assert_eq!(result.stdout, b"clean\n");
    assert!(!Path::new(&harness.scratch).join("main.sh").exists());

    Ok(())
}
