// Execution Events
// Progress reporting and event types for pipeline execution

use crate::execution::job::JobState;
use crate::execution::results::{Phase, Status};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted {
        pipeline_name: String,
        total_jobs: usize,
    },

    /// Pipeline execution completed
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// Job picked up by a worker
    JobStarted { job_index: usize, job_name: String },

    /// Job moved through its state machine
    JobStateChanged { job_index: usize, state: JobState },

    /// Job finished (successfully or not)
    JobCompleted {
        job_index: usize,
        job_name: String,
        success: bool,
        failure: Option<String>,
        duration: Duration,
    },

    /// Phase started
    PhaseStarted {
        job_index: usize,
        phase: Phase,
        total_steps: usize,
    },

    /// Phase completed
    PhaseCompleted {
        job_index: usize,
        phase: Phase,
        status: Status,
        duration: Duration,
    },

    /// Phase never started because something earlier failed
    PhaseSkipped {
        job_index: usize,
        phase: Phase,
        reason: String,
    },

    /// Step execution started
    StepStarted {
        job_index: usize,
        phase: Phase,
        step_name: String,
        step_index: usize,
    },

    /// Step or suite output (stdout/stderr)
    StepOutput {
        job_index: usize,
        step_name: String,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        job_index: usize,
        phase: Phase,
        step_name: String,
        step_index: usize,
        status: Status,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was not executed
    StepSkipped {
        job_index: usize,
        phase: Phase,
        step_name: String,
        step_index: usize,
        reason: String,
    },

    /// A step changed the job environment
    EnvChanged {
        job_index: usize,
        name: String,
        value: String,
    },

    /// Test suite started
    SuiteStarted {
        job_index: usize,
        suite_name: String,
        workers: Option<u32>,
    },

    /// Test suite completed
    SuiteCompleted {
        job_index: usize,
        suite_name: String,
        status: Status,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Test suite was not executed
    SuiteSkipped {
        job_index: usize,
        suite_name: String,
        reason: String,
    },

    /// The verdict notification was delivered
    NotificationSent { channel: String },

    /// The verdict notification could not be delivered
    NotificationFailed { channel: String, message: String },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_index: Option<usize>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a pipeline started event
    pub fn pipeline_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_jobs,
        }
    }

    /// Create a pipeline completed event
    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    /// Create a job started event
    pub fn job_started(job_index: usize, job_name: impl Into<String>) -> Self {
        Self::JobStarted {
            job_index,
            job_name: job_name.into(),
        }
    }

    /// Create a job completed event
    pub fn job_completed(
        job_index: usize,
        job_name: impl Into<String>,
        success: bool,
        failure: Option<String>,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_index,
            job_name: job_name.into(),
            success,
            failure,
            duration,
        }
    }

    /// Create a step started event
    pub fn step_started(
        job_index: usize,
        phase: Phase,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            job_index,
            phase,
            step_name: step_name.into(),
            step_index,
        }
    }

    /// Create a step output event
    pub fn step_output(
        job_index: usize,
        step_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job_index,
            step_name: step_name.into(),
            output: output.into(),
            is_error,
        }
    }

    /// Create a step completed event
    pub fn step_completed(
        job_index: usize,
        phase: Phase,
        step_name: impl Into<String>,
        step_index: usize,
        status: Status,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job_index,
            phase,
            step_name: step_name.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_index: Option<usize>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_index,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_index: Option<usize>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_index,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_index: Option<usize>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_index,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
