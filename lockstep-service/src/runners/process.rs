// Process execution
// Spawns a command, streams its output line by line and enforces timeouts

use crate::runners::OutputCallback;

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long output readers may keep draining once a timed-out process is killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Output collected from a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Output for a process that never started
    pub fn spawn_failure(program: &str, error: impl std::fmt::Display) -> Self {
        Self {
            stderr: format!("failed to spawn '{}': {}", program, error),
            ..Default::default()
        }
    }

    /// Output with only an exit code, used by test doubles
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }
}

/// How the child's environment is built
#[derive(Debug, Clone)]
pub enum ProcessEnv {
    /// Start from an empty environment and set exactly these variables
    Exact(BTreeMap<String, String>),
    /// Inherit the orchestrator's environment
    Inherit,
}

/// Run `argv` to completion, streaming lines to `on_output` as they arrive
pub async fn run_process(
    argv: &[String],
    env: ProcessEnv,
    timeout: Option<Duration>,
    on_output: Option<OutputCallback>,
) -> CommandOutput {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutput::spawn_failure("", "empty command line");
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let ProcessEnv::Exact(vars) = &env {
        cmd.env_clear();
        cmd.envs(vars);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    // Own process group, so a timeout can take down everything the command started
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return CommandOutput::spawn_failure(program, e),
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill().await;
        return CommandOutput::spawn_failure(program, "output pipes unavailable");
    };

    let stdout_handle = tokio::spawn(collect_lines(stdout, on_output.clone(), false));
    let stderr_handle = tokio::spawn(collect_lines(stderr, on_output, true));

    let wait_result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                kill_tree(&mut child).await;
                let stdout = drain(stdout_handle).await;
                let mut stderr = drain(stderr_handle).await;
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("process timed out after {:?}", limit));
                return CommandOutput {
                    stdout,
                    stderr,
                    exit_code: None,
                    timed_out: true,
                };
            }
        },
        None => child.wait().await,
    };

    let exit_code = match wait_result {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "failed to wait for process");
            None
        }
    };

    CommandOutput {
        stdout: stdout_handle.await.unwrap_or_default(),
        stderr: stderr_handle.await.unwrap_or_default(),
        exit_code,
        timed_out: false,
    }
}

/// Kill the child and every process in its group
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = format!("-{}", pid);
        let status = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            tracing::warn!(pid, error = %e, "failed to kill process group");
        }
    }
    let _ = child.kill().await;
}

/// Join a reader task, giving up if something still holds the pipe open
async fn drain(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

async fn collect_lines<R>(reader: R, on_output: Option<OutputCallback>, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(callback) = &on_output {
            callback(&line, is_stderr);
        }
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}
