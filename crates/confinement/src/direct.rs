use std::ffi::OsString;

use async_trait::async_trait;

use crate::spec::{ConfinementMode, Invocation, LaunchSpec};
use crate::{base_env, check_workspace, Confiner, ConfinementError};

/// Runs programs directly on the host with the workspace as working
/// directory. Only selected when secure mode is explicitly disabled.
#[derive(Debug, Clone, Default)]
pub struct DirectConfiner;

impl DirectConfiner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Confiner for DirectConfiner {
    fn mode(&self) -> ConfinementMode {
        ConfinementMode::Unconfined
    }

    fn launch_spec(&self, invocation: &Invocation) -> Result<LaunchSpec, ConfinementError> {
        check_workspace(&invocation.workspace)?;

        let mut env = base_env(&invocation.workspace);
        env.extend(
            invocation
                .env
                .iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        );

        Ok(LaunchSpec {
            mode: ConfinementMode::Unconfined,
            program: invocation.program.clone(),
            args: invocation.args.iter().map(OsString::from).collect(),
            current_dir: invocation.workspace.clone(),
            env,
            rlimits: None,
            cgroup: None,
        })
    }
}
