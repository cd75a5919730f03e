// Suite Executor
// Runs every test suite as the provisioned identity and records each outcome

use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::results::{FailurePolicy, Phase, Status, SuiteResult};
use crate::execution::steps::StepRunner;
use crate::pipeline::models::{RunAs, Suite};
use crate::runners::Invocation;

use std::time::Instant;

/// Runs test suites sequentially; a failing suite never stops the next one
pub struct SuiteExecutor<'a> {
    steps: &'a StepRunner<'a>,
    workers_override: Option<u32>,
}

impl<'a> SuiteExecutor<'a> {
    pub const POLICY: FailurePolicy = FailurePolicy::RunAll;

    pub fn new(steps: &'a StepRunner<'a>) -> Self {
        Self {
            steps,
            workers_override: None,
        }
    }

    /// Replace every suite's worker count
    pub fn with_workers_override(mut self, workers: Option<u32>) -> Self {
        self.workers_override = workers;
        self
    }

    /// Invocation for a suite: identity principal, allow-listed env, rooted at the tree
    pub fn invocation_for(&self, ctx: &ExecutionContext, suite: &Suite) -> Invocation {
        Invocation {
            script: ctx.expand(&suite.command_line(self.workers_override)),
            principal: ctx.principal(RunAs::Provisioned),
            env: ctx.forwarded_env(&suite.pass_env),
            working_dir: suite.tree.as_deref().map(|tree| ctx.expand(tree)),
            timeout: suite.timeout,
        }
    }

    /// Run all suites in order. `before_each` is called with the suite index before it starts.
    pub async fn run_all<F>(&self, ctx: &ExecutionContext, suites: &[Suite], mut before_each: F) -> Vec<SuiteResult>
    where
        F: FnMut(usize, &Suite),
    {
        debug_assert_eq!(Phase::Test.policy(), Self::POLICY);

        let mut results = Vec::with_capacity(suites.len());
        for (index, suite) in suites.iter().enumerate() {
            before_each(index, suite);
            results.push(self.run_suite(ctx, suite).await);
        }
        results
    }

    pub async fn run_suite(&self, ctx: &ExecutionContext, suite: &Suite) -> SuiteResult {
        let job_index = ctx.job_index;
        let invocation = self.invocation_for(ctx, suite);
        let workers = suite.effective_workers(self.workers_override);

        self.steps.progress().send_event(ExecutionEvent::SuiteStarted {
            job_index,
            suite_name: suite.name.clone(),
            workers,
        });
        tracing::info!(job = job_index, suite = %suite.name, workers = ?workers, "running suite");

        let start = Instant::now();
        let output = self
            .steps
            .runner()
            .run(&invocation, self.steps.output_callback(job_index, &suite.name))
            .await;
        let duration = start.elapsed();

        let status = if output.success() {
            Status::Succeeded
        } else {
            tracing::warn!(
                job = job_index,
                suite = %suite.name,
                exit_code = ?output.exit_code,
                timed_out = output.timed_out,
                "suite failed"
            );
            Status::Failed
        };

        self.steps.progress().send_event(ExecutionEvent::SuiteCompleted {
            job_index,
            suite_name: suite.name.clone(),
            status,
            duration,
            exit_code: output.exit_code,
        });

        SuiteResult {
            name: suite.name.clone(),
            command: invocation.script,
            status,
            workers,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            duration,
            stdout: output.stdout,
            stderr: output.stderr,
            skip_reason: None,
        }
    }

    /// Results for suites that never ran
    pub fn skip_all(&self, ctx: &ExecutionContext, suites: &[Suite], reason: &str) -> Vec<SuiteResult> {
        suites
            .iter()
            .map(|suite| {
                self.steps.progress().send_event(ExecutionEvent::SuiteSkipped {
                    job_index: ctx.job_index,
                    suite_name: suite.name.clone(),
                    reason: reason.to_string(),
                });
                SuiteResult::skipped(
                    &suite.name,
                    ctx.expand(&suite.command_line(self.workers_override)),
                    reason,
                )
            })
            .collect()
    }
}
