// Execution Results
// Per-step, per-phase, per-suite and per-job outcomes

use crate::error::ProvisionError;
use crate::execution::matrix::{Identity, JobConfig};
use crate::runners::CommandOutput;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Reason recorded on everything that did not run because something earlier failed
pub const SKIPPED_PRIOR_FAILURE: &str = "not run due to prior failure";

/// Job phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provision,
    Lint,
    Install,
    Test,
}

impl Phase {
    /// Failure policy each phase runs under
    pub fn policy(&self) -> FailurePolicy {
        match self {
            Phase::Provision | Phase::Lint | Phase::Install => FailurePolicy::FailFast,
            Phase::Test => FailurePolicy::RunAll,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Provision => write!(f, "provision"),
            Phase::Lint => write!(f, "lint"),
            Phase::Install => write!(f, "install"),
            Phase::Test => write!(f, "test"),
        }
    }
}

/// What happens to the rest of a phase after one of its units fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failure and skip everything after it
    FailFast,
    /// Run every unit, then fail the phase if any unit failed
    RunAll,
}

/// Outcome of a step, suite or phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Succeeded,
    Failed,
    /// Not executed; distinct from failed
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Succeeded => write!(f, "succeeded"),
            Status::Failed => write!(f, "failed"),
            Status::Skipped => write!(f, "skipped"),
        }
    }
}

pub(crate) fn serialize_secs<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(duration.as_secs_f64())
}

/// Result of a single step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepResult {
    pub fn from_output(name: impl Into<String>, output: CommandOutput, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: if output.success() {
                Status::Succeeded
            } else {
                Status::Failed
            },
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            duration,
            stdout: output.stdout,
            stderr: output.stderr,
            skip_reason: None,
        }
    }

    /// A step that could not be run at all
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Failed,
            exit_code: None,
            timed_out: false,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: message.into(),
            skip_reason: None,
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Skipped,
            exit_code: None,
            timed_out: false,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            skip_reason: Some(reason.into()),
        }
    }

    /// Short description of why the step failed
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exited with {}", code),
                None => "did not run to completion".to_string(),
            }
        }
    }
}

/// Result of a whole phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: Status,
    pub steps: Vec<StepResult>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl PhaseResult {
    /// Build from executed steps; the phase fails if any step failed
    pub fn from_steps(phase: Phase, steps: Vec<StepResult>, duration: Duration) -> Self {
        let status = if steps.iter().any(|s| s.status == Status::Failed) {
            Status::Failed
        } else {
            Status::Succeeded
        };
        Self {
            phase,
            status,
            steps,
            duration,
            skip_reason: None,
        }
    }

    /// A phase that never started; every step is recorded as skipped
    pub fn skipped<'a>(
        phase: Phase,
        step_names: impl IntoIterator<Item = &'a str>,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        Self {
            phase,
            status: Status::Skipped,
            steps: step_names
                .into_iter()
                .map(|name| StepResult::skipped(name, reason.clone()))
                .collect(),
            duration: Duration::ZERO,
            skip_reason: Some(reason),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Succeeded
    }

    /// The step that failed the phase, if any
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status == Status::Failed)
    }
}

/// Result of one test suite invocation
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub name: String,
    pub command: String,
    pub status: Status,
    /// Parallelism degree requested from the test runner
    pub workers: Option<u32>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl SuiteResult {
    pub fn skipped(name: impl Into<String>, command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            status: Status::Skipped,
            workers: None,
            exit_code: None,
            timed_out: false,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            skip_reason: Some(reason.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == Status::Succeeded
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The execution context could not be set up
    Provision { error: ProvisionError },
    /// A lint or install step exited non-zero
    Step {
        phase: Phase,
        step: String,
        exit_code: Option<i32>,
        timed_out: bool,
    },
    /// One or more suites failed; all of them still ran
    Suites { failed: Vec<String> },
    /// The job task itself died
    Aborted { message: String },
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Provision { error } => write!(f, "{}", error),
            JobFailure::Step {
                phase,
                step,
                exit_code,
                timed_out,
            } => {
                write!(f, "{} step '{}' ", phase, step)?;
                match (timed_out, exit_code) {
                    (true, _) => write!(f, "timed out"),
                    (false, Some(code)) => write!(f, "exited with {}", code),
                    (false, None) => write!(f, "did not run to completion"),
                }
            }
            JobFailure::Suites { failed } => write!(f, "suites failed: {}", failed.join(", ")),
            JobFailure::Aborted { message } => write!(f, "job aborted: {}", message),
        }
    }
}

/// Everything recorded about one matrix job
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub index: usize,
    pub name: String,
    pub axes: IndexMap<String, String>,
    pub identity: Identity,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Provision, lint and install, always in that order
    pub phases: Vec<PhaseResult>,
    pub suites: Vec<SuiteResult>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Sandbox teardown problem; does not affect the verdict
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
}

impl JobResult {
    /// Result for a job whose task never returned
    pub fn aborted(job: &JobConfig, message: impl Into<String>) -> Self {
        Self {
            index: job.index,
            name: job.name.clone(),
            axes: job.axes.clone(),
            identity: job.identity.clone(),
            success: false,
            failure: Some(JobFailure::Aborted {
                message: message.into(),
            }),
            phases: Vec::new(),
            suites: Vec::new(),
            duration: Duration::ZERO,
            cleanup_error: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn suite(&self, name: &str) -> Option<&SuiteResult> {
        self.suites.iter().find(|s| s.name == name)
    }
}
