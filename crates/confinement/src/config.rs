use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfinementError;

pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;
pub const DEFAULT_PIDS_MAX: u64 = 64;

/// Process-wide sandbox settings. Loaded once at startup and handed to
/// [`crate::build_confiner`]; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub secure_mode: bool,
    pub memory_limit_mb: u64,
    pub pids_max: u64,
    #[serde(default)]
    pub confinement_tool_path: Option<PathBuf>,
    pub network_isolated: bool,
    /// Delegated cgroup v2 directory under which one child cgroup is created
    /// per launch. Required in secure mode: the per-launch `pids.max` is the
    /// only process ceiling that does not depend on other processes of the
    /// same user.
    #[serde(default)]
    pub cgroup_parent: Option<PathBuf>,
    /// Host paths bound read-only at the same location inside the sandbox, in
    /// addition to the root filesystem.
    #[serde(default)]
    pub extra_ro_paths: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            secure_mode: true,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            pids_max: DEFAULT_PIDS_MAX,
            confinement_tool_path: None,
            network_isolated: true,
            cgroup_parent: None,
            extra_ro_paths: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfinementError> {
        if self.memory_limit_mb == 0 {
            return Err(ConfinementError::InvalidConfig {
                message: "memory limit must be greater than zero".to_string(),
            });
        }

        if self.pids_max == 0 {
            return Err(ConfinementError::InvalidConfig {
                message: "process limit must be greater than zero".to_string(),
            });
        }

        if let Some(tool) = &self.confinement_tool_path {
            if !tool.is_absolute() {
                return Err(ConfinementError::InvalidConfig {
                    message: format!(
                        "confinement tool path '{}' must be absolute",
                        tool.display()
                    ),
                });
            }
        }

        match &self.cgroup_parent {
            None if self.secure_mode => {
                return Err(ConfinementError::InvalidConfig {
                    message: "secure mode requires a cgroup parent to enforce the per-launch process ceiling"
                        .to_string(),
                });
            }
            Some(parent) if !parent.is_absolute() => {
                return Err(ConfinementError::InvalidConfig {
                    message: format!("cgroup parent '{}' must be absolute", parent.display()),
                });
            }
            _ => {}
        }

        for path in &self.extra_ro_paths {
            if !path.is_absolute() {
                return Err(ConfinementError::InvalidConfig {
                    message: format!("read-only path '{}' must be absolute", path.display()),
                });
            }
        }

        Ok(())
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self.memory_limit_mb.saturating_mul(1024 * 1024),
            max_processes: self.pids_max,
        }
    }
}

/// Ceilings applied to every confined launch. Memory is enforced both as an
/// address-space rlimit and by the launch cgroup; the process ceiling only by
/// the launch cgroup's `pids.max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub max_processes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secure_config() -> SandboxConfig {
        SandboxConfig {
            cgroup_parent: Some(PathBuf::from("/sys/fs/cgroup/codebox")),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_secure() {
        let config = SandboxConfig::default();
        assert!(config.secure_mode);
        assert!(config.network_isolated);
        secure_config().validate().unwrap();
    }

    #[test]
    fn secure_mode_requires_cgroup_parent() {
        let err = SandboxConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfinementError::InvalidConfig { .. }));
        assert!(err.to_string().contains("cgroup parent"));

        let unconfined = SandboxConfig {
            secure_mode: false,
            ..Default::default()
        };
        unconfined.validate().unwrap();
    }

    #[test]
    fn limits_convert_megabytes() {
        let config = SandboxConfig {
            memory_limit_mb: 128,
            pids_max: 16,
            ..Default::default()
        };
        let limits = config.limits();
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.max_processes, 16);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = SandboxConfig {
            memory_limit_mb: 0,
            ..secure_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfinementError::InvalidConfig { .. })
        ));

        let config = SandboxConfig {
            pids_max: 0,
            ..secure_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_paths_are_rejected() {
        let config = SandboxConfig {
            confinement_tool_path: Some(PathBuf::from("bin/bwrap")),
            ..secure_config()
        };
        assert!(config.validate().is_err());

        let config = SandboxConfig {
            cgroup_parent: Some(PathBuf::from("sys/fs/cgroup/codebox")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_from_camel_case() {
        let config: SandboxConfig = serde_json::from_value(serde_json::json!({
            "secureMode": false,
            "memoryLimitMb": 64,
            "pidsMax": 8,
            "networkIsolated": true
        }))
        .unwrap();
        assert!(!config.secure_mode);
        assert_eq!(config.memory_limit_mb, 64);
        assert!(config.confinement_tool_path.is_none());
    }
}
