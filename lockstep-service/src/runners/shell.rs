// Shell Runner
// Executes invocations directly on the orchestrator host, switching identity through sudo

use crate::error::RunnerError;
use crate::execution::matrix::JobConfig;
use crate::runners::process::{run_process, CommandOutput, ProcessEnv};
use crate::runners::{Backend, CommandRunner, Invocation, OutputCallback, Principal, SYSTEM_PATH};

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration for host execution
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Shell used for every script
    pub shell: String,
    /// Privilege escalation tool
    pub sudo: String,
    /// Run root steps through sudo as well (when the orchestrator is not root)
    pub root_via_sudo: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            sudo: "sudo".to_string(),
            root_via_sudo: false,
        }
    }
}

/// Backend that runs every job on the local host
pub struct HostBackend {
    config: HostConfig,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
        }
    }

    pub fn with_config(config: HostConfig) -> Self {
        Self { config }
    }

    fn locate(tool: &str) -> Result<PathBuf, RunnerError> {
        which::which(tool).map_err(|_| RunnerError::ToolMissing(tool.to_string()))
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for HostBackend {
    fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
        env
    }

    async fn open(&self, job: &JobConfig) -> Result<Box<dyn CommandRunner>, RunnerError> {
        Self::locate(&self.config.shell)?;
        let sudo = Self::locate(&self.config.sudo)?;

        tracing::debug!(job = %job.name, sudo = %sudo.display(), "opened host context");

        Ok(Box::new(ShellRunner {
            config: HostConfig {
                sudo: sudo.to_string_lossy().into_owned(),
                ..self.config.clone()
            },
        }))
    }
}

/// Runs invocations on the host
pub struct ShellRunner {
    config: HostConfig,
}

impl ShellRunner {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Command line for an invocation.
    ///
    /// Anything that crosses into another identity goes through
    /// `env -i`, so the target sees exactly `invocation.env`.
    pub fn argv(&self, invocation: &Invocation) -> Vec<String> {
        let script = invocation.shell_script();

        let switch_to = match &invocation.principal {
            Principal::Root if !self.config.root_via_sudo => {
                return vec![self.config.shell.clone(), "-c".to_string(), script];
            }
            Principal::Root => None,
            Principal::User(user) => Some(user),
        };

        let mut argv = vec![self.config.sudo.clone(), "-n".to_string()];
        if let Some(user) = switch_to {
            argv.push("-H".to_string());
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        argv.push("--".to_string());
        argv.push("env".to_string());
        argv.push("-i".to_string());
        argv.extend(invocation.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        argv.push(self.config.shell.clone());
        argv.push("-c".to_string());
        argv.push(script);
        argv
    }

    fn process_env(&self, invocation: &Invocation) -> ProcessEnv {
        match (&invocation.principal, self.config.root_via_sudo) {
            (Principal::Root, false) => ProcessEnv::Exact(invocation.env.clone()),
            _ => {
                let mut env = BTreeMap::new();
                env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
                ProcessEnv::Exact(env)
            }
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, invocation: &Invocation, on_output: Option<OutputCallback>) -> CommandOutput {
        let argv = self.argv(invocation);
        run_process(
            &argv,
            self.process_env(invocation),
            invocation.timeout,
            on_output,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(script: &str, principal: Principal) -> Invocation {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
        env.insert("PACKAGE".to_string(), "firedrake".to_string());
        Invocation {
            principal,
            env,
            ..Invocation::root(script)
        }
    }

    #[test]
    fn test_argv_root() {
        let runner = ShellRunner::new(HostConfig::default());
        let argv = runner.argv(&invocation("make lint", Principal::Root));
        assert_eq!(argv, vec!["sh", "-c", "make lint"]);
    }

    #[test]
    fn test_argv_user_goes_through_sudo_with_exact_env() {
        let runner = ShellRunner::new(HostConfig::default());
        let argv = runner.argv(&invocation(
            "make test",
            Principal::User("firedrake".to_string()),
        ));

        assert_eq!(
            argv,
            vec![
                "sudo",
                "-n",
                "-H",
                "-u",
                "firedrake",
                "--",
                "env",
                "-i",
                "PACKAGE=firedrake",
                &format!("PATH={}", SYSTEM_PATH),
                "sh",
                "-c",
                "make test",
            ]
        );
    }

    #[test]
    fn test_argv_root_via_sudo() {
        let runner = ShellRunner::new(HostConfig {
            root_via_sudo: true,
            ..HostConfig::default()
        });
        let argv = runner.argv(&invocation("useradd x", Principal::Root));
        assert_eq!(&argv[..4], &["sudo", "-n", "--", "env"]);
        assert!(!argv.contains(&"-u".to_string()));
    }

    #[tokio::test]
    async fn test_root_run_sees_only_invocation_env() {
        let runner = ShellRunner::new(HostConfig::default());
        let output = runner
            .run(
                &invocation("echo \"$PACKAGE:${HOME:-none}\"", Principal::Root),
                None,
            )
            .await;

        assert!(output.success());
        assert_eq!(output.stdout, "firedrake:none");
    }

    #[tokio::test]
    async fn test_root_run_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation("pwd", Principal::Root);
        inv.working_dir = Some(dir.path().to_string_lossy().into_owned());

        let runner = ShellRunner::new(HostConfig::default());
        let output = runner.run(&inv, None).await;

        assert!(output.success());
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(&output.stdout).canonicalize().unwrap(),
            expected
        );
    }

    #[test]
    fn test_base_env_has_path() {
        let backend = HostBackend::new();
        assert_eq!(backend.base_env().get("PATH").unwrap(), SYSTEM_PATH);
    }
}
