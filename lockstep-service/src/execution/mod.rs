// Execution Engine Module
// Matrix expansion, per-job provisioning and phases, and result aggregation

pub mod aggregate;
pub mod context;
pub mod events;
pub mod executor;
pub mod job;
pub mod matrix;
pub mod provision;
pub mod results;
pub mod steps;
pub mod suites;

// Re-export key types
pub use aggregate::{NotificationOutcome, NotifyTarget, PipelineResult, ResultAggregator};
pub use context::{EnvChange, ExecutionContext, PrivilegeGrant};
pub use events::{progress_channel, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{ExecutorConfig, PipelineExecutor};
pub use job::{JobRunner, JobState, JobStateMachine};
pub use matrix::{Identity, IdentityPolicy, JobConfig, MatrixExpander};
pub use provision::Provisioner;
pub use results::{
    FailurePolicy, JobFailure, JobResult, Phase, PhaseResult, Status, StepResult, SuiteResult,
    SKIPPED_PRIOR_FAILURE,
};
pub use steps::{parse_env_directives, StepRunner};
pub use suites::SuiteExecutor;
