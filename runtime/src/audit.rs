use capsules_code_exec::{ExecError, ExecutionResult};
use capsules_lsp_bridge::SessionEnd;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use session_registry::{SessionKind, SessionRegistry};
use tracing::{error, info, warn};

/// Structured audit event for one API request against the sandbox
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiAuditEvent {
    pub event_type: ApiEventType,
    pub outcome: String,
    pub code: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiEventType {
    /// Program ran to an outcome: success, failure or timeout
    ExecutionCompleted,
    /// Submission refused before anything was launched
    ExecutionRejected,
    /// Server-side failure while preparing or running a submission
    ExecutionFailed,
    BridgeSessionEnded,
}

impl ApiEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiEventType::ExecutionCompleted => "execution.completed",
            ApiEventType::ExecutionRejected => "execution.rejected",
            ApiEventType::ExecutionFailed => "execution.failed",
            ApiEventType::BridgeSessionEnded => "bridge.session_ended",
        }
    }
}

/// Metrics recorder for the sandbox API
pub struct SandboxMetrics;

impl SandboxMetrics {
    pub fn increment_execution(outcome: &str) {
        counter!("codebox_executions_total", 1, "outcome" => outcome.to_string());
    }

    pub fn record_execution_duration(duration_ms: u64) {
        histogram!("codebox_execution_duration_ms", duration_ms as f64);
    }

    pub fn increment_truncation() {
        counter!("codebox_output_truncations_total", 1);
    }

    pub fn increment_rejection(reason: &str) {
        counter!("codebox_rejections_total", 1, "reason" => reason.to_string());
    }

    pub fn increment_bridge_session(end: &str) {
        counter!("codebox_bridge_sessions_total", 1, "end" => end.to_string());
    }

    /// Publish the number of open sessions per kind
    pub fn record_active_sessions(registry: &SessionRegistry) {
        for kind in [SessionKind::Execution, SessionKind::Bridge] {
            gauge!(
                "codebox_sessions_active",
                registry.active_by_kind(kind) as f64,
                "kind" => kind.prefix()
            );
        }
    }
}

/// Audit recorder: one structured log line and the matching metrics per event
pub struct ApiAuditor;

impl ApiAuditor {
    pub fn emit_event(event: &ApiAuditEvent) {
        let event_name = event.event_type.as_str();
        match event.event_type {
            ApiEventType::ExecutionCompleted => {
                info!(
                    event = event_name,
                    outcome = %event.outcome,
                    duration_ms = event.duration_ms,
                    truncated = event.truncated,
                    "Execution completed"
                );
                SandboxMetrics::increment_execution(&event.outcome);
                if event.truncated {
                    SandboxMetrics::increment_truncation();
                }
            }
            ApiEventType::ExecutionRejected => {
                warn!(
                    event = event_name,
                    code = %event.code.as_deref().unwrap_or("unknown"),
                    error = %event.error.as_deref().unwrap_or("unknown"),
                    "Execution rejected"
                );
                SandboxMetrics::increment_rejection(event.code.as_deref().unwrap_or("unknown"));
            }
            ApiEventType::ExecutionFailed => {
                error!(
                    event = event_name,
                    code = %event.code.as_deref().unwrap_or("unknown"),
                    error = %event.error.as_deref().unwrap_or("unknown"),
                    "Execution failed"
                );
                SandboxMetrics::increment_execution(&event.outcome);
            }
            ApiEventType::BridgeSessionEnded => {
                info!(
                    event = event_name,
                    end = %event.outcome,
                    error = %event.error.as_deref().unwrap_or("none"),
                    "Bridge session ended"
                );
                SandboxMetrics::increment_bridge_session(&event.outcome);
            }
        }

        if let Some(duration) = event.duration_ms {
            SandboxMetrics::record_execution_duration(duration);
        }
    }

    pub fn execution_completed(result: &ExecutionResult) -> ApiAuditEvent {
        ApiAuditEvent {
            event_type: ApiEventType::ExecutionCompleted,
            outcome: result.outcome().to_string(),
            code: None,
            error: None,
            duration_ms: Some(result.execution_time_ms),
            truncated: result.truncated,
        }
    }

    pub fn execution_error(err: &ExecError) -> ApiAuditEvent {
        let event_type = if err.is_rejection() {
            ApiEventType::ExecutionRejected
        } else {
            ApiEventType::ExecutionFailed
        };
        ApiAuditEvent {
            event_type,
            outcome: "error".to_string(),
            code: Some(err.code().to_string()),
            error: Some(err.to_string()),
            duration_ms: None,
            truncated: false,
        }
    }

    /// A request refused before it reached the executor, such as an
    /// unreadable or oversized body.
    pub fn request_rejected(code: &str, error: impl Into<String>) -> ApiAuditEvent {
        ApiAuditEvent {
            event_type: ApiEventType::ExecutionRejected,
            outcome: "error".to_string(),
            code: Some(code.to_string()),
            error: Some(error.into()),
            duration_ms: None,
            truncated: false,
        }
    }

    pub fn bridge_session_ended(end: &SessionEnd) -> ApiAuditEvent {
        let error = match end {
            SessionEnd::ClientClosed | SessionEnd::CompanionExited => None,
            other => Some(other.to_string()),
        };
        ApiAuditEvent {
            event_type: ApiEventType::BridgeSessionEnded,
            outcome: end.label().to_string(),
            code: None,
            error,
            duration_ms: None,
            truncated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            success,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: if timed_out { None } else { Some(0) },
            execution_time_ms: 12,
            timed_out,
            truncated: true,
        }
    }

    #[test]
    fn completed_event_carries_outcome_and_duration() {
        let event = ApiAuditor::execution_completed(&result(false, true));
        assert_eq!(event.event_type, ApiEventType::ExecutionCompleted);
        assert_eq!(event.outcome, "timeout");
        assert_eq!(event.duration_ms, Some(12));
        assert!(event.truncated);
        ApiAuditor::emit_event(&event);
    }

    #[test]
    fn oversized_code_is_a_rejection() {
        let err = ExecError::CodeTooLarge {
            size: 10,
            limit: 5,
        };
        let event = ApiAuditor::execution_error(&err);
        assert_eq!(event.event_type, ApiEventType::ExecutionRejected);
        assert_eq!(event.code.as_deref(), Some("EXEC_CODE_TOO_LARGE"));
    }

    #[test]
    fn body_rejection_is_a_rejection() {
        let event = ApiAuditor::request_rejected("INVALID_REQUEST", "missing field `code`");
        assert_eq!(event.event_type, ApiEventType::ExecutionRejected);
        assert_eq!(event.code.as_deref(), Some("INVALID_REQUEST"));
        ApiAuditor::emit_event(&event);
    }

    #[test]
    fn server_failures_are_not_rejections() {
        let err = ExecError::InvalidConfig {
            message: "broken".to_string(),
        };
        let event = ApiAuditor::execution_error(&err);
        assert_eq!(event.event_type, ApiEventType::ExecutionFailed);
        assert_eq!(event.outcome, "error");
    }

    #[test]
    fn bridge_event_uses_end_label() {
        let event = ApiAuditor::bridge_session_ended(&SessionEnd::Launch("refused".to_string()));
        assert_eq!(event.outcome, "launch_failed");
        assert!(event.error.unwrap().contains("refused"));

        let event = ApiAuditor::bridge_session_ended(&SessionEnd::ClientClosed);
        assert_eq!(event.outcome, "client_closed");
        assert!(event.error.is_none());
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_value(ApiEventType::BridgeSessionEnded).unwrap();
        assert_eq!(json, "bridge_session_ended");
    }
}
