// Runners Module
// Backends that execute shell invocations on the host or inside per-job containers

pub mod container;
pub mod process;
pub mod shell;

#[cfg(test)]
pub(crate) mod scripted;

pub use container::{ContainerBackend, ContainerConfig, ContainerRunner, ImagePullPolicy};
pub use process::CommandOutput;
pub use shell::{HostBackend, HostConfig, ShellRunner};

use crate::error::RunnerError;
use crate::execution::matrix::JobConfig;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The account an invocation runs as, resolved from a step's `RunAs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Root,
    User(String),
}

/// A single shell command ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub script: String,
    pub principal: Principal,
    /// Exactly the variables the command should see
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn root(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            principal: Principal::Root,
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Script prefixed with a `cd` into the working directory, if any
    pub fn shell_script(&self) -> String {
        match &self.working_dir {
            Some(dir) => format!("cd {} && {}", crate::utils::shell_quote(dir), self.script),
            None => self.script.clone(),
        }
    }
}

/// Callback for handling output lines in real-time (line, is_stderr)
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Executes invocations inside one job's execution context
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; failures to spawn are reported in the output, not as errors
    async fn run(&self, invocation: &Invocation, on_output: Option<OutputCallback>)
        -> CommandOutput;

    /// Release the context (remove a container, etc.)
    async fn shutdown(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Creates a fresh execution context for each job
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Variables every job environment starts from (e.g. a sane PATH)
    fn base_env(&self) -> BTreeMap<String, String>;

    /// Open the context a job runs in
    async fn open(&self, job: &JobConfig) -> Result<Box<dyn CommandRunner>, RunnerError>;
}

/// Search path used inside freshly provisioned environments
pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_script_with_working_dir() {
        let mut invocation = Invocation::root("make test");
        assert_eq!(invocation.shell_script(), "make test");

        invocation.working_dir = Some("/home/fire drake".to_string());
        assert_eq!(invocation.shell_script(), "cd '/home/fire drake' && make test");
    }
}
