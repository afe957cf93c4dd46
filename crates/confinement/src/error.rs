use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfinementError {
    #[error("Confinement tool '{tool}' is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Namespace creation refused by {tool}: {stderr}")]
    NamespaceUnavailable { tool: String, stderr: String },

    #[error("Invalid sandbox configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Workspace {path} cannot be confined: {reason}")]
    Workspace { path: PathBuf, reason: String },

    #[error("Cgroup setup failed at {path}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfinementError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfinementError::ToolUnavailable { .. } => "CONFINEMENT_TOOL_UNAVAILABLE",
            ConfinementError::NamespaceUnavailable { .. } => "CONFINEMENT_NAMESPACE_UNAVAILABLE",
            ConfinementError::InvalidConfig { .. } => "CONFINEMENT_INVALID_CONFIG",
            ConfinementError::Workspace { .. } => "CONFINEMENT_WORKSPACE_ERROR",
            ConfinementError::Cgroup { .. } => "CONFINEMENT_CGROUP_ERROR",
        }
    }
}
