// Lockstep Service Library
// Core engine for parsing and executing matrix build-and-test pipelines

pub mod error;
pub mod execution;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod runners;
pub mod utils;

// Re-export commonly used types
pub use error::{
    ConfigError, NotifyError, ProvisionError, ProvisionStage, RunnerError, ValidationErrors,
};

// Re-export parser types
pub use parser::{ParseError, ParseErrorKind, ParseResult, PipelineDefinition, PipelineParser};

// Re-export pipeline types
pub use pipeline::{Isolation, Pipeline, PipelineValidator};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, ExecutorConfig, JobResult, JobState, MatrixExpander,
    PipelineExecutor, PipelineResult, ProgressReceiver, ProgressSender,
};

// Re-export notification and reporting types
pub use notify::{Notification, Notifier, WebhookNotifier};
pub use report::{ReportFormat, Reporter};

// Re-export runner types
pub use runners::{Backend, CommandRunner, ContainerBackend, HostBackend};
