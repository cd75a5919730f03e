// Job Runner
// Drives one matrix job through provisioning, lint, install and test

use crate::error::{ProvisionError, ProvisionStage};
use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobConfig;
use crate::execution::provision::Provisioner;
use crate::execution::results::{
    JobFailure, JobResult, Phase, PhaseResult, Status, StepResult, SuiteResult,
    SKIPPED_PRIOR_FAILURE,
};
use crate::execution::steps::StepRunner;
use crate::execution::suites::SuiteExecutor;
use crate::pipeline::models::{Pipeline, Step};
use crate::runners::Backend;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

/// Lifecycle of a single job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Provisioning,
    Linting,
    Installing,
    /// Running the suite with this index
    Testing(usize),
    Done { success: bool },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done { .. })
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Any non-terminal state may fail straight to `Done`; success is only
    /// reachable once the install phase is over.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        match (*self, next) {
            (Done { .. }, _) => false,
            (_, Done { success: false }) => true,
            (Pending, Provisioning) => true,
            (Provisioning, Linting) => true,
            (Linting, Installing) => true,
            (Installing, Testing(0)) => true,
            (Installing, Done { success: true }) => true,
            (Testing(current), Testing(following)) => following == current + 1,
            (Testing(_), Done { success: true }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Provisioning => write!(f, "provisioning"),
            JobState::Linting => write!(f, "linting"),
            JobState::Installing => write!(f, "installing"),
            JobState::Testing(index) => write!(f, "testing suite {}", index + 1),
            JobState::Done { success: true } => write!(f, "done (success)"),
            JobState::Done { success: false } => write!(f, "done (failure)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Job state machine with checked transitions
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    state: JobState,
    history: Vec<JobState>,
}

impl JobStateMachine {
    pub fn new() -> Self {
        Self {
            state: JobState::Pending,
            history: vec![JobState::Pending],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a single job to completion
pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    job: JobConfig,
    workers_override: Option<u32>,
    progress_tx: Option<ProgressSender>,
    machine: JobStateMachine,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>, job: JobConfig) -> Self {
        Self {
            pipeline,
            job,
            workers_override: None,
            progress_tx: None,
            machine: JobStateMachine::new(),
        }
    }

    pub fn with_workers_override(mut self, workers: Option<u32>) -> Self {
        self.workers_override = workers;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    fn advance(&mut self, next: JobState) {
        match self.machine.transition(next) {
            Ok(()) => {
                tracing::debug!(job = self.job.index, state = %next, "job state changed");
                self.progress_tx.send_event(ExecutionEvent::JobStateChanged {
                    job_index: self.job.index,
                    state: next,
                });
            }
            Err(e) => tracing::error!(job = self.job.index, error = %e, "job state machine rejected transition"),
        }
    }

    /// Run the job on a fresh context from `backend`
    pub async fn run(self, backend: &dyn Backend) -> JobResult {
        let span = tracing::info_span!("job", job = self.job.index, name = %self.job.name);
        self.run_in_span(backend).instrument(span).await
    }

    async fn run_in_span(mut self, backend: &dyn Backend) -> JobResult {
        let start = Instant::now();
        let pipeline = self.pipeline.clone();

        self.progress_tx
            .send_event(ExecutionEvent::job_started(self.job.index, &self.job.name));
        tracing::info!("job started");

        self.advance(JobState::Provisioning);

        let runner = match backend.open(&self.job).await {
            Ok(runner) => runner,
            Err(e) => {
                let error = ProvisionError::new(ProvisionStage::Sandbox, e.to_string());
                tracing::error!(error = %error, "could not open execution context");
                let phases = vec![
                    PhaseResult::from_steps(
                        Phase::Provision,
                        vec![StepResult::failed("start sandbox", e.to_string())],
                        start.elapsed(),
                    ),
                    self.skip_phase(Phase::Lint, &pipeline.lint),
                    self.skip_phase(Phase::Install, &pipeline.install),
                ];
                let suites = self.skip_suites_without_context(&pipeline);
                return self.finish(start, phases, suites, Some(JobFailure::Provision { error }), None);
            }
        };

        let mut ctx = ExecutionContext::new(&self.job, backend.base_env(), pipeline.forward_env.clone());
        let steps = StepRunner::new(runner.as_ref(), self.progress_tx.clone());
        let suite_executor = SuiteExecutor::new(&steps).with_workers_override(self.workers_override);

        let mut phases = Vec::with_capacity(3);
        let mut failure = None;

        let (provision, provision_error) = Provisioner::new(&pipeline.provision)
            .provision(&steps, &mut ctx)
            .await;
        phases.push(provision);
        if let Some(error) = provision_error {
            failure = Some(JobFailure::Provision { error });
        }

        for (phase, state, phase_steps) in [
            (Phase::Lint, JobState::Linting, &pipeline.lint),
            (Phase::Install, JobState::Installing, &pipeline.install),
        ] {
            if failure.is_some() {
                phases.push(self.skip_phase(phase, phase_steps));
                continue;
            }

            self.advance(state);
            let result = steps.run_phase(&mut ctx, phase, phase_steps).await;
            if let Some(step) = result.failed_step() {
                failure = Some(JobFailure::Step {
                    phase,
                    step: step.name.clone(),
                    exit_code: step.exit_code,
                    timed_out: step.timed_out,
                });
            }
            phases.push(result);
        }

        let suites = if failure.is_some() {
            suite_executor.skip_all(&ctx, &pipeline.suites, SKIPPED_PRIOR_FAILURE)
        } else {
            suite_executor
                .run_all(&ctx, &pipeline.suites, |index, _| {
                    self.advance(JobState::Testing(index))
                })
                .await
        };

        let failed: Vec<String> = suites
            .iter()
            .filter(|s| s.status == Status::Failed)
            .map(|s| s.name.clone())
            .collect();
        if failure.is_none() && !failed.is_empty() {
            failure = Some(JobFailure::Suites { failed });
        }

        drop(suite_executor);
        drop(steps);
        let cleanup_error = match runner.shutdown().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to release execution context");
                Some(e.to_string())
            }
        };

        self.finish(start, phases, suites, failure, cleanup_error)
    }

    fn finish(
        mut self,
        start: Instant,
        phases: Vec<PhaseResult>,
        suites: Vec<SuiteResult>,
        failure: Option<JobFailure>,
        cleanup_error: Option<String>,
    ) -> JobResult {
        let success = failure.is_none();
        self.advance(JobState::Done { success });

        let duration = start.elapsed();
        let summary = failure.as_ref().map(|f| f.to_string());
        match &summary {
            None => tracing::info!(duration = ?duration, "job succeeded"),
            Some(reason) => tracing::warn!(duration = ?duration, reason = %reason, "job failed"),
        }
        self.progress_tx.send_event(ExecutionEvent::job_completed(
            self.job.index,
            &self.job.name,
            success,
            summary,
            duration,
        ));

        JobResult {
            index: self.job.index,
            name: self.job.name,
            axes: self.job.axes,
            identity: self.job.identity,
            success,
            failure,
            phases,
            suites,
            duration,
            cleanup_error,
        }
    }

    fn skip_phase(&self, phase: Phase, steps: &[Step]) -> PhaseResult {
        self.progress_tx.send_event(ExecutionEvent::PhaseSkipped {
            job_index: self.job.index,
            phase,
            reason: SKIPPED_PRIOR_FAILURE.to_string(),
        });
        PhaseResult::skipped(phase, steps.iter().map(|s| s.name.as_str()), SKIPPED_PRIOR_FAILURE)
    }

    fn skip_suites_without_context(&self, pipeline: &Pipeline) -> Vec<SuiteResult> {
        pipeline
            .suites
            .iter()
            .map(|suite| {
                self.progress_tx.send_event(ExecutionEvent::SuiteSkipped {
                    job_index: self.job.index,
                    suite_name: suite.name.clone(),
                    reason: SKIPPED_PRIOR_FAILURE.to_string(),
                });
                SuiteResult::skipped(
                    &suite.name,
                    suite.command_line(self.workers_override),
                    SKIPPED_PRIOR_FAILURE,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::parser::PipelineParser;
    use crate::pipeline::PipelineValidator;
    use crate::runners::scripted::ScriptedBackend;

    const PIPELINE: &str = r#"
matrix:
  BASE_IMAGE: ["ubuntu:14.04", "ubuntu:16.04"]
env:
  PACKAGE: firedrake
  HOME_DIR: /home/firedrake
  TEST_UID: 1000
  TEST_GID: 1000
  CI: 1
isolation:
  mode: container
lint:
  - name: flake8
    run: make lint
install:
  installer:
    script: firedrake-install
    switches: [disable-ssh]
  activate:
    prepend_path: ["${HOME_DIR}/firedrake/bin"]
tests:
  tree: "${HOME_DIR}/firedrake/src/firedrake"
  suites:
    - name: regression
      path: tests/regression
      workers: 4
    - name: multigrid
      path: tests/multigrid
"#;

    fn setup() -> (Arc<Pipeline>, Vec<JobConfig>) {
        let pipeline =
            PipelineValidator::resolve(PipelineParser::parse(PIPELINE).unwrap()).unwrap();
        let jobs = MatrixExpander::expand(&pipeline);
        (Arc::new(pipeline), jobs)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut machine = JobStateMachine::new();
        for state in [
            JobState::Provisioning,
            JobState::Linting,
            JobState::Installing,
            JobState::Testing(0),
            JobState::Testing(1),
            JobState::Done { success: true },
        ] {
            machine.transition(state).unwrap();
        }
        assert!(machine.state().is_terminal());
        assert_eq!(machine.history().len(), 7);
    }

    #[test]
    fn test_state_machine_rejects_illegal_transitions() {
        let mut machine = JobStateMachine::new();
        assert!(machine.transition(JobState::Installing).is_err());
        assert!(machine.transition(JobState::Done { success: true }).is_err());

        machine.transition(JobState::Provisioning).unwrap();
        machine.transition(JobState::Done { success: false }).unwrap();
        let err = machine.transition(JobState::Linting).unwrap_err();
        assert_eq!(err.from, JobState::Done { success: false });
    }

    #[test]
    fn test_testing_states_advance_one_at_a_time() {
        assert!(JobState::Testing(0).can_transition_to(JobState::Testing(1)));
        assert!(!JobState::Testing(0).can_transition_to(JobState::Testing(2)));
        assert!(JobState::Testing(1).can_transition_to(JobState::Done { success: false }));
    }

    #[tokio::test]
    async fn test_job_success() {
        let (pipeline, jobs) = setup();
        let backend = ScriptedBackend::new();

        let result = JobRunner::new(pipeline, jobs[0].clone()).run(&backend).await;

        assert!(result.success);
        assert!(result.failure.is_none());
        assert_eq!(result.phases.len(), 3);
        assert_eq!(result.suites.len(), 2);
        assert_eq!(backend.shutdowns(), vec![0]);

        // Activation made the installed toolchain visible to the suites
        let recorded = backend.recorded();
        let suite = recorded
            .iter()
            .find(|r| r.invocation.script.contains("tests/regression"))
            .unwrap();
        assert!(suite
            .invocation
            .env
            .get("PATH")
            .unwrap()
            .starts_with("/home/firedrake/firedrake/bin:"));
    }

    #[tokio::test]
    async fn test_lint_failure_skips_install_and_suites() {
        let (pipeline, jobs) = setup();
        let backend = ScriptedBackend::new().fail_on("make lint", 1);

        let result = JobRunner::new(pipeline, jobs[0].clone()).run(&backend).await;

        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(JobFailure::Step { phase: Phase::Lint, .. })
        ));
        assert_eq!(result.phase(Phase::Install).unwrap().status, Status::Skipped);
        assert!(result.suites.iter().all(|s| s.status == Status::Skipped));
        assert!(!backend
            .scripts_for(0)
            .iter()
            .any(|s| s.contains("firedrake-install") || s.contains("pytest")));
        // Context is released even after a failure
        assert_eq!(backend.shutdowns(), vec![0]);
    }

    #[tokio::test]
    async fn test_suite_failure_still_runs_second_suite() {
        let (pipeline, jobs) = setup();
        let backend = ScriptedBackend::new().fail_on("tests/regression", 1);

        let result = JobRunner::new(pipeline, jobs[0].clone()).run(&backend).await;

        assert!(!result.success);
        assert_eq!(result.suite("regression").unwrap().status, Status::Failed);
        assert_eq!(result.suite("multigrid").unwrap().status, Status::Succeeded);
        assert_eq!(
            result.failure,
            Some(JobFailure::Suites {
                failed: vec!["regression".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_provision_error() {
        let (pipeline, jobs) = setup();
        let backend = ScriptedBackend::new().fail_open(1);

        let result = JobRunner::new(pipeline, jobs[1].clone()).run(&backend).await;

        match &result.failure {
            Some(JobFailure::Provision { error }) => assert_eq!(error.stage, ProvisionStage::Sandbox),
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(result.phase(Phase::Provision).unwrap().status, Status::Failed);
        assert_eq!(result.phase(Phase::Lint).unwrap().status, Status::Skipped);
        assert!(backend.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_state_events_follow_machine() {
        let (pipeline, jobs) = setup();
        let backend = ScriptedBackend::new();
        let (tx, mut rx) = crate::execution::events::progress_channel();

        JobRunner::new(pipeline, jobs[0].clone())
            .with_progress(tx)
            .run(&backend)
            .await;

        let mut states = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::JobStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                JobState::Provisioning,
                JobState::Linting,
                JobState::Installing,
                JobState::Testing(0),
                JobState::Testing(1),
                JobState::Done { success: true },
            ]
        );
    }
}
