// Result Aggregation
// Combines job outcomes into the pipeline verdict and sends the single notification

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::results::{serialize_secs, JobResult};
use crate::notify::{Notification, Notifier};
use crate::parser::models::NotifyDefinition;

use serde::Serialize;
use std::time::Duration;

/// What happened to the verdict notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent { channel: String },
    Failed { channel: String, error: String },
    /// No notify block, no webhook configured, or notifications turned off
    Disabled,
}

/// Aggregate outcome of every job in a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub commit: Option<String>,
    /// True iff every job's every phase and suite succeeded
    pub success: bool,
    /// Ordered by job index
    pub jobs: Vec<JobResult>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub notification: NotificationOutcome,
}

impl PipelineResult {
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|job| !job.success)
    }
}

/// Where the verdict notification goes
pub struct NotifyTarget<'a> {
    pub definition: &'a NotifyDefinition,
    pub notifier: &'a dyn Notifier,
}

/// Collects job results and produces the pipeline verdict
pub struct ResultAggregator {
    pipeline: String,
    commit: Option<String>,
    jobs: Vec<JobResult>,
}

impl ResultAggregator {
    pub fn new(pipeline: impl Into<String>, commit: Option<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            commit,
            jobs: Vec::new(),
        }
    }

    pub fn record(&mut self, job: JobResult) {
        self.jobs.push(job);
    }

    /// Pass iff at least one job ran and every job passed
    pub fn success(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|job| job.success)
    }

    /// Human-readable verdict line plus one line per failed job
    pub fn summary(&self) -> String {
        let total = self.jobs.len();
        let failed: Vec<&JobResult> = self.jobs.iter().filter(|job| !job.success).collect();
        let at = self
            .commit
            .as_deref()
            .map(|commit| format!(" at {}", commit))
            .unwrap_or_default();

        if self.success() {
            return format!("{}: passed ({} of {} jobs){}", self.pipeline, total, total, at);
        }

        let mut text = format!(
            "{}: FAILED ({} of {} jobs failed){}",
            self.pipeline,
            failed.len(),
            total,
            at
        );
        for job in failed {
            let reason = job
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "failed".to_string());
            text.push_str(&format!("\n- {}: {}", job.name, reason));
        }
        text
    }

    pub fn notification(&self, definition: &NotifyDefinition) -> Notification {
        Notification {
            channel: definition.channel.clone(),
            username: definition.sender.clone(),
            text: self.summary(),
            success: self.success(),
            commit: self.commit.clone(),
            pipeline: self.pipeline.clone(),
        }
    }

    /// Produce the final result, sending exactly one notification if a target is given.
    ///
    /// Delivery failures are logged and recorded; they never change the verdict.
    pub async fn finish(
        mut self,
        target: Option<NotifyTarget<'_>>,
        duration: Duration,
        progress_tx: &Option<ProgressSender>,
    ) -> PipelineResult {
        self.jobs.sort_by_key(|job| job.index);
        let success = self.success();

        let notification = match target {
            None => NotificationOutcome::Disabled,
            Some(target) => {
                let notification = self.notification(target.definition);
                let channel = notification.channel.clone();
                match target.notifier.notify(&notification).await {
                    Ok(()) => {
                        tracing::info!(channel = %channel, success, "notification sent");
                        progress_tx.send_event(ExecutionEvent::NotificationSent {
                            channel: channel.clone(),
                        });
                        NotificationOutcome::Sent { channel }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "notification delivery failed");
                        progress_tx.send_event(ExecutionEvent::NotificationFailed {
                            channel: channel.clone(),
                            message: e.to_string(),
                        });
                        NotificationOutcome::Failed {
                            channel,
                            error: e.to_string(),
                        }
                    }
                }
            }
        };

        PipelineResult {
            pipeline: self.pipeline,
            commit: self.commit,
            success,
            jobs: self.jobs,
            duration,
            notification,
        }
    }
}
