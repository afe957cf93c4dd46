use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use capsules_code_exec::{ExecError, ExecutionRequest};
use confinement::ConfinementError;

use super::{AppState, ErrorResponse};
use crate::audit::{ApiAuditor, SandboxMetrics};

pub fn routes() -> Router {
    Router::new().route("/execute", post(execute_code))
}

/// POST /api/execute
///
/// A program that fails or times out is still a 200; its outcome is in the
/// body. Errors, including bodies refused before parsing, use the shared
/// `{error, code}` body.
async fn execute_code(
    Extension(state): Extension<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return body_rejected(&rejection, state.executor.limits().max_code_bytes);
        }
    };

    let response = match state.executor.execute(&request).await {
        Ok(result) => {
            ApiAuditor::emit_event(&ApiAuditor::execution_completed(&result));
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err) => {
            ApiAuditor::emit_event(&ApiAuditor::execution_error(&err));
            (
                status_for(&err),
                Json(ErrorResponse::new(err.to_string(), err.code())),
            )
                .into_response()
        }
    };
    SandboxMetrics::record_active_sessions(&state.registry);
    response
}

fn body_rejected(rejection: &JsonRejection, max_code_bytes: usize) -> Response {
    let status = rejection.status();
    let (code, error) = if status == StatusCode::PAYLOAD_TOO_LARGE {
        (
            "EXEC_CODE_TOO_LARGE",
            format!(
                "Request body is too large; submitted code is limited to {} bytes",
                max_code_bytes
            ),
        )
    } else {
        ("INVALID_REQUEST", rejection.body_text())
    };
    ApiAuditor::emit_event(&ApiAuditor::request_rejected(code, error.clone()));
    (status, Json(ErrorResponse::new(error, code))).into_response()
}

fn status_for(err: &ExecError) -> StatusCode {
    match err {
        ExecError::CodeTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ExecError::Confinement(
            ConfinementError::ToolUnavailable { .. } | ConfinementError::NamespaceUnavailable { .. },
        ) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
