// Provisioner
// Creates the job's unprivileged identity, its passwordless grant, and hands it the home directory

use crate::error::{ProvisionError, ProvisionStage};
use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::results::{Phase, PhaseResult, Status, SKIPPED_PRIOR_FAILURE};
use crate::execution::steps::StepRunner;
use crate::pipeline::models::{ProvisionSettings, RunAs, Step};
use crate::utils::shell_join;

use std::time::Instant;

/// One provisioning command and the stage it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionStep {
    pub stage: ProvisionStage,
    pub step: Step,
}

/// Builds and runs the provisioning sequence for a job
pub struct Provisioner<'a> {
    settings: &'a ProvisionSettings,
}

impl<'a> Provisioner<'a> {
    pub fn new(settings: &'a ProvisionSettings) -> Self {
        Self { settings }
    }

    /// The ordered provisioning steps for a context.
    ///
    /// Setup steps run after the grant and before the ownership transfer,
    /// so nothing runs as the new identity until its home belongs to it.
    pub fn plan(&self, ctx: &ExecutionContext) -> Vec<ProvisionStep> {
        let identity = &ctx.identity;
        let uid = identity.uid.to_string();
        let gid = identity.gid.to_string();

        let mut plan = vec![
            ProvisionStep {
                stage: ProvisionStage::Group,
                step: Step::new(
                    "create group",
                    shell_join(["groupadd", "-g", &gid, &identity.user]),
                ),
            },
            ProvisionStep {
                stage: ProvisionStage::Identity,
                step: Step::new(
                    "create user",
                    shell_join([
                        "useradd",
                        "-m",
                        "-d",
                        &identity.home,
                        "-u",
                        &uid,
                        "-g",
                        &gid,
                        "-s",
                        &self.settings.shell,
                        &identity.user,
                    ]),
                ),
            },
            ProvisionStep {
                stage: ProvisionStage::Grant,
                step: Step::new("grant sudo", ctx.grant.install_script()),
            },
        ];

        plan.extend(self.settings.setup.iter().map(|step| ProvisionStep {
            stage: ProvisionStage::Setup,
            step: Step {
                run_as: RunAs::Root,
                ..step.clone()
            },
        }));

        plan.push(ProvisionStep {
            stage: ProvisionStage::Ownership,
            step: Step::new(
                "transfer home ownership",
                shell_join(["chown", "-R", &format!("{}:{}", uid, gid), &identity.home]),
            ),
        });

        plan
    }

    /// Run the provisioning sequence. The first failure is fatal and never retried.
    pub async fn provision(
        &self,
        steps: &StepRunner<'_>,
        ctx: &mut ExecutionContext,
    ) -> (PhaseResult, Option<ProvisionError>) {
        let start = Instant::now();
        let plan = self.plan(ctx);
        let job_index = ctx.job_index;

        steps.progress().send_event(ExecutionEvent::PhaseStarted {
            job_index,
            phase: Phase::Provision,
            total_steps: plan.len(),
        });
        tracing::info!(
            job = job_index,
            user = %ctx.identity.user,
            uid = ctx.identity.uid,
            home = %ctx.identity.home,
            "provisioning identity"
        );

        let mut results = Vec::with_capacity(plan.len());
        let mut error = None;

        for (index, item) in plan.iter().enumerate() {
            if error.is_some() {
                results.push(steps.skip_step(
                    job_index,
                    Phase::Provision,
                    index,
                    &item.step,
                    SKIPPED_PRIOR_FAILURE,
                ));
                continue;
            }

            let result = steps.run_step(ctx, Phase::Provision, index, &item.step).await;
            if result.status == Status::Failed {
                let detail = match result.stderr.lines().last() {
                    Some(line) if !line.trim().is_empty() => {
                        format!("'{}' {}: {}", item.step.name, result.failure_summary(), line.trim())
                    }
                    _ => format!("'{}' {}", item.step.name, result.failure_summary()),
                };
                let failure = ProvisionError::new(item.stage, detail).with_exit_code(result.exit_code);
                tracing::error!(job = job_index, error = %failure, "provisioning failed");
                error = Some(failure);
            }
            results.push(result);
        }

        let phase = PhaseResult::from_steps(Phase::Provision, results, start.elapsed());
        steps.progress().send_event(ExecutionEvent::PhaseCompleted {
            job_index,
            phase: Phase::Provision,
            status: phase.status,
            duration: phase.duration,
        });
        (phase, error)
    }
}
