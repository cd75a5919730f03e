// Step Runner
// Executes ordered steps inside a job's context and threads environment changes between them

use crate::execution::context::{EnvChange, ExecutionContext};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::results::{FailurePolicy, Phase, PhaseResult, Status, StepResult, SKIPPED_PRIOR_FAILURE};
use crate::pipeline::models::Step;
use crate::runners::{CommandRunner, OutputCallback};

use std::sync::Arc;
use std::time::Instant;

/// Runs steps for one job
pub struct StepRunner<'a> {
    runner: &'a dyn CommandRunner,
    progress_tx: Option<ProgressSender>,
}

impl<'a> StepRunner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, progress_tx: Option<ProgressSender>) -> Self {
        Self {
            runner,
            progress_tx,
        }
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    pub fn progress(&self) -> &Option<ProgressSender> {
        &self.progress_tx
    }

    /// Run a phase's steps in order under the phase's failure policy.
    ///
    /// With fail-fast, steps after the first failure are recorded as skipped
    /// and never reach the runner.
    pub async fn run_phase(&self, ctx: &mut ExecutionContext, phase: Phase, steps: &[Step]) -> PhaseResult {
        let start = Instant::now();
        let policy = phase.policy();
        let job_index = ctx.job_index;

        self.progress_tx.send_event(ExecutionEvent::PhaseStarted {
            job_index,
            phase,
            total_steps: steps.len(),
        });
        tracing::info!(job = job_index, phase = %phase, steps = steps.len(), "phase started");

        let mut results = Vec::with_capacity(steps.len());
        let mut failed = false;

        for (index, step) in steps.iter().enumerate() {
            if failed && policy == FailurePolicy::FailFast {
                results.push(self.skip_step(job_index, phase, index, step, SKIPPED_PRIOR_FAILURE));
                continue;
            }

            let result = self.run_step(ctx, phase, index, step).await;
            if result.status == Status::Failed {
                failed = true;
            }
            results.push(result);
        }

        let result = PhaseResult::from_steps(phase, results, start.elapsed());
        self.progress_tx.send_event(ExecutionEvent::PhaseCompleted {
            job_index,
            phase,
            status: result.status,
            duration: result.duration,
        });
        tracing::info!(job = job_index, phase = %phase, status = %result.status, "phase finished");
        result
    }

    /// Run a single step. Environment changes are applied only if it succeeds.
    pub async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        phase: Phase,
        index: usize,
        step: &Step,
    ) -> StepResult {
        let job_index = ctx.job_index;
        let invocation = ctx.invocation_for(step);

        self.progress_tx
            .send_event(ExecutionEvent::step_started(job_index, phase, &step.name, index));
        tracing::debug!(
            job = job_index,
            phase = %phase,
            step = %step.name,
            principal = ?invocation.principal,
            "running step"
        );

        let start = Instant::now();
        let output = self
            .runner
            .run(&invocation, self.output_callback(job_index, &step.name))
            .await;
        let duration = start.elapsed();

        let directives = parse_env_directives(&output.stdout);
        let result = StepResult::from_output(&step.name, output, duration);

        if result.status == Status::Succeeded {
            for change in directives {
                if ctx.apply_change(&change) {
                    self.announce(ctx, &change);
                } else {
                    tracing::warn!(job = job_index, step = %step.name, ?change, "ignoring invalid environment directive");
                }
            }
            for change in ctx.apply_effects(&step.effects) {
                self.announce(ctx, &change);
            }
        } else {
            tracing::warn!(
                job = job_index,
                phase = %phase,
                step = %step.name,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                "step failed"
            );
        }

        self.progress_tx.send_event(ExecutionEvent::step_completed(
            job_index,
            phase,
            &step.name,
            index,
            result.status,
            result.duration,
            result.exit_code,
        ));
        result
    }

    pub(crate) fn skip_step(&self, job_index: usize, phase: Phase, index: usize, step: &Step, reason: &str) -> StepResult {
        self.progress_tx.send_event(ExecutionEvent::StepSkipped {
            job_index,
            phase,
            step_name: step.name.clone(),
            step_index: index,
            reason: reason.to_string(),
        });
        StepResult::skipped(&step.name, reason)
    }

    fn announce(&self, ctx: &ExecutionContext, change: &EnvChange) {
        let (name, value) = match change {
            EnvChange::Set { name, value } => (name.as_str(), value.as_str()),
            EnvChange::PrependPath(_) => ("PATH", ctx.get("PATH").unwrap_or_default()),
        };
        tracing::debug!(job = ctx.job_index, name = %name, value = %value, "environment changed");
        self.progress_tx.send_event(ExecutionEvent::EnvChanged {
            job_index: ctx.job_index,
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Forward output lines to the progress channel, if anyone is listening
    pub(crate) fn output_callback(&self, job_index: usize, name: &str) -> Option<OutputCallback> {
        let tx = self.progress_tx.clone()?;
        let name = name.to_string();
        Some(Arc::new(move |line: &str, is_error: bool| {
            tx.send_event(ExecutionEvent::step_output(job_index, &name, line, is_error));
        }))
    }
}

/// Parse environment directives from step output.
///
/// `::set-env NAME=VALUE` sets a variable and `::add-path DIR` prepends
/// to PATH. Other lines are ignored.
pub fn parse_env_directives(output: &str) -> Vec<EnvChange> {
    let mut changes = Vec::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("::set-env ") {
            if let Some((name, value)) = rest.split_once('=') {
                changes.push(EnvChange::Set {
                    name: name.trim().to_string(),
                    value: value.to_string(),
                });
            }
        } else if let Some(dir) = line.strip_prefix("::add-path ") {
            changes.push(EnvChange::PrependPath(dir.trim().to_string()));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::{Identity, JobConfig};
    use crate::runners::scripted::ScriptedBackend;
    use crate::runners::CommandOutput;

    use indexmap::IndexMap;
    use std::collections::BTreeMap;

    fn context() -> ExecutionContext {
        let mut env = BTreeMap::new();
        env.insert("HOME_DIR".to_string(), "/home/firedrake".to_string());
        let job = JobConfig {
            index: 0,
            name: "A=1".to_string(),
            axes: IndexMap::new(),
            env,
            identity: Identity {
                user: "firedrake".to_string(),
                uid: 1000,
                gid: 1000,
                home: "/home/firedrake".to_string(),
            },
        };
        let mut base = BTreeMap::new();
        base.insert("PATH".to_string(), "/usr/bin".to_string());
        ExecutionContext::new(&job, base, vec!["PATH".to_string()])
    }

    fn steps() -> Vec<Step> {
        vec![
            Step::new("one", "step-one"),
            Step::new("two", "step-two"),
            Step::new("three", "step-three"),
            Step::new("four", "step-four"),
        ]
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_steps() {
        let backend = ScriptedBackend::new().fail_on("step-two", 2);
        let runner = backend.runner(0);
        let steps_runner = StepRunner::new(&runner, None);
        let mut ctx = context();

        let result = steps_runner.run_phase(&mut ctx, Phase::Install, &steps()).await;

        assert_eq!(result.status, Status::Failed);
        let statuses: Vec<Status> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Succeeded, Status::Failed, Status::Skipped, Status::Skipped]
        );
        assert_eq!(result.failed_step().unwrap().name, "two");
        assert_eq!(result.failed_step().unwrap().exit_code, Some(2));
        // Steps three and four never reached the runner
        assert_eq!(backend.scripts_for(0), vec!["step-one", "step-two"]);
    }

    #[tokio::test]
    async fn test_run_all_policy_continues() {
        let backend = ScriptedBackend::new().fail_on("step-one", 1);
        let runner = backend.runner(0);
        let steps_runner = StepRunner::new(&runner, None);
        let mut ctx = context();

        let result = steps_runner.run_phase(&mut ctx, Phase::Test, &steps()).await;

        assert_eq!(result.status, Status::Failed);
        assert_eq!(backend.scripts_for(0).len(), 4);
    }

    #[tokio::test]
    async fn test_effects_applied_only_on_success() {
        let backend = ScriptedBackend::new().fail_on("broken", 1);
        let runner = backend.runner(0);
        let steps_runner = StepRunner::new(&runner, None);
        let mut ctx = context();

        let failing = Step::new("broken", "broken").with_export("BROKEN", "1");
        steps_runner.run_step(&mut ctx, Phase::Install, 0, &failing).await;
        assert_eq!(ctx.get("BROKEN"), None);

        let activate = Step::new("activate", "true").with_prepend_path("${HOME_DIR}/venv/bin");
        steps_runner.run_step(&mut ctx, Phase::Install, 1, &activate).await;
        assert_eq!(ctx.get("PATH"), Some("/home/firedrake/venv/bin:/usr/bin"));
    }

    #[tokio::test]
    async fn test_directives_from_stdout() {
        let output = CommandOutput {
            stdout: "building\n::set-env PETSC_ARCH=default\n::add-path /opt/petsc/bin".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        let backend = ScriptedBackend::new().on("configure", output);
        let runner = backend.runner(0);
        let steps_runner = StepRunner::new(&runner, None);
        let mut ctx = context();

        steps_runner
            .run_step(&mut ctx, Phase::Install, 0, &Step::new("configure", "configure"))
            .await;

        assert_eq!(ctx.get("PETSC_ARCH"), Some("default"));
        assert_eq!(ctx.get("PATH"), Some("/opt/petsc/bin:/usr/bin"));

        let next = ctx.invocation_for(&Step::new("t", "pytest").as_provisioned());
        assert_eq!(next.env.get("PATH").unwrap(), "/opt/petsc/bin:/usr/bin");
    }

    #[tokio::test]
    async fn test_step_events_are_emitted() {
        let backend = ScriptedBackend::new();
        let runner = backend.runner(0);
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let steps_runner = StepRunner::new(&runner, Some(tx));
        let mut ctx = context();

        steps_runner
            .run_phase(&mut ctx, Phase::Lint, &[Step::new("flake8", "make lint")])
            .await;
        drop(steps_runner);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                ExecutionEvent::PhaseStarted { .. } => "phase_started",
                ExecutionEvent::StepStarted { .. } => "step_started",
                ExecutionEvent::StepCompleted { .. } => "step_completed",
                ExecutionEvent::PhaseCompleted { .. } => "phase_completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["phase_started", "step_started", "step_completed", "phase_completed"]
        );
    }

    #[test]
    fn test_parse_env_directives() {
        let changes = parse_env_directives(
            "noise\n::set-env VIRTUAL_ENV=/home/fd/venv\n::add-path /home/fd/venv/bin\n::set-env broken",
        );
        assert_eq!(
            changes,
            vec![
                EnvChange::Set {
                    name: "VIRTUAL_ENV".to_string(),
                    value: "/home/fd/venv".to_string(),
                },
                EnvChange::PrependPath("/home/fd/venv/bin".to_string()),
            ]
        );
    }
}
