// Container Runner
// Gives each job a disposable Docker container and executes invocations inside it

use crate::error::RunnerError;
use crate::execution::matrix::JobConfig;
use crate::pipeline::models::WorkspaceMount;
use crate::runners::process::{run_process, CommandOutput, ProcessEnv};
use crate::runners::{Backend, CommandRunner, Invocation, OutputCallback, Principal, SYSTEM_PATH};

use std::collections::BTreeMap;

pub use crate::parser::models::ImagePullPolicy;

/// Configuration for container execution
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker client binary
    pub docker: String,
    /// Whether to pull images before running
    pub pull_policy: ImagePullPolicy,
    /// Leave containers behind after the job for debugging
    pub keep: bool,
    /// Host directory mounted into the container, also its working directory
    pub workspace: Option<WorkspaceMount>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            keep: false,
            workspace: None,
        }
    }
}

/// Backend that starts one container per job from the job's image axis value
pub struct ContainerBackend {
    config: ContainerConfig,
    image_axis: String,
}

impl ContainerBackend {
    pub fn new(image_axis: impl Into<String>) -> Self {
        Self::with_config(image_axis, ContainerConfig::default())
    }

    pub fn with_config(image_axis: impl Into<String>, config: ContainerConfig) -> Self {
        Self {
            config,
            image_axis: image_axis.into(),
        }
    }

    /// Arguments for starting a job's long-lived container
    pub fn run_args(&self, name: &str, image: &str) -> Vec<String> {
        let mut argv = vec![
            self.config.docker.clone(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if let Some(workspace) = &self.config.workspace {
            argv.push("-v".to_string());
            argv.push(format!(
                "{}:{}",
                workspace.source.display(),
                workspace.target
            ));
            argv.push("-w".to_string());
            argv.push(workspace.target.clone());
        }
        argv.push(image.to_string());
        argv.push("sleep".to_string());
        argv.push("infinity".to_string());
        argv
    }

    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RunnerError> {
        let docker = self.config.docker.clone();
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let argv = vec![
                    docker,
                    "image".to_string(),
                    "inspect".to_string(),
                    image.to_string(),
                ];
                if run_process(&argv, ProcessEnv::Inherit, None, None)
                    .await
                    .success()
                {
                    Ok(())
                } else {
                    self.pull_image(image).await
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RunnerError> {
        tracing::info!(image = %image, "pulling image");
        let argv = vec![
            self.config.docker.clone(),
            "pull".to_string(),
            image.to_string(),
        ];
        let output = run_process(&argv, ProcessEnv::Inherit, None, None).await;
        if !output.success() {
            return Err(RunnerError::SandboxStart {
                image: image.to_string(),
                message: format!("pull failed: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for ContainerBackend {
    fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
        env
    }

    async fn open(&self, job: &JobConfig) -> Result<Box<dyn CommandRunner>, RunnerError> {
        which::which(&self.config.docker)
            .map_err(|_| RunnerError::ToolMissing(self.config.docker.clone()))?;

        let image = job
            .axis(&self.image_axis)
            .ok_or_else(|| RunnerError::MissingImage(self.image_axis.clone()))?
            .to_string();

        self.pull_image_if_needed(&image).await?;

        let name = format!("lockstep-{}-{}", job.index, uuid_v4_simple());
        let output = run_process(
            &self.run_args(&name, &image),
            ProcessEnv::Inherit,
            None,
            None,
        )
        .await;
        if !output.success() {
            return Err(RunnerError::SandboxStart {
                image,
                message: output.stderr.trim().to_string(),
            });
        }

        tracing::info!(job = %job.name, container = %name, image = %image, "started container");

        Ok(Box::new(ContainerRunner {
            docker: self.config.docker.clone(),
            name,
            image,
            keep: self.config.keep,
        }))
    }
}

/// Handle to one job's running container
#[derive(Debug)]
pub struct ContainerRunner {
    docker: String,
    name: String,
    image: String,
    keep: bool,
}

impl ContainerRunner {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Command line for an invocation; the job env travels as `-e` flags
    pub fn exec_args(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = vec![self.docker.clone(), "exec".to_string()];
        if let Principal::User(user) = &invocation.principal {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        for (key, value) in &invocation.env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        argv.push(self.name.clone());
        // Killing the exec client leaves the process alive in the container
        if let Some(limit) = invocation.timeout {
            let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
            argv.push("timeout".to_string());
            argv.push("-s".to_string());
            argv.push("KILL".to_string());
            argv.push(secs.max(1).to_string());
        }
        argv.push("sh".to_string());
        argv.push("-c".to_string());
        argv.push(invocation.shell_script());
        argv
    }
}

#[async_trait::async_trait]
impl CommandRunner for ContainerRunner {
    async fn run(&self, invocation: &Invocation, on_output: Option<OutputCallback>) -> CommandOutput {
        run_process(
            &self.exec_args(invocation),
            ProcessEnv::Inherit,
            invocation.timeout,
            on_output,
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), RunnerError> {
        if self.keep {
            tracing::info!(container = %self.name, "keeping container");
            return Ok(());
        }

        let argv = vec![
            self.docker.clone(),
            "rm".to_string(),
            "-f".to_string(),
            self.name.clone(),
        ];
        let output = run_process(&argv, ProcessEnv::Inherit, None, None).await;
        if !output.success() {
            return Err(RunnerError::SandboxRemove {
                id: self.name.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Generate a simple UUID-like string (8 chars)
fn uuid_v4_simple() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let nanos = duration.as_nanos();
    format!("{:08x}", (nanos as u32) ^ std::process::id())
}
