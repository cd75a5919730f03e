// Pipeline Executor
// Expands the matrix and runs every job in its own context, bounded by a semaphore

use crate::execution::aggregate::{NotifyTarget, PipelineResult, ResultAggregator};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::job::JobRunner;
use crate::execution::matrix::MatrixExpander;
use crate::execution::results::JobResult;
use crate::notify::Notifier;
use crate::pipeline::models::{Isolation, Pipeline, WorkspaceMount, COMMIT_ENV};
use crate::runners::{Backend, ContainerBackend, ContainerConfig, HostBackend, HostConfig};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Configuration for pipeline execution
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Maximum jobs running at once (0 = unlimited)
    pub max_parallel: usize,
    /// Triggering commit reference, exported to every job as `COMMIT` and
    /// carried into the result and notification
    pub commit: Option<String>,
    /// Worker count forced on every suite
    pub workers_override: Option<u32>,
    /// Escalate root steps through sudo on the host backend
    pub root_via_sudo: bool,
}

/// Pipeline executor
pub struct PipelineExecutor {
    config: ExecutorConfig,
    backend: Option<Arc<dyn Backend>>,
    notifier: Option<Arc<dyn Notifier>>,
    event_tx: Option<ProgressSender>,
}

impl PipelineExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            backend: None,
            notifier: None,
            event_tx: None,
        }
    }

    /// Use a specific backend instead of the one the pipeline's isolation selects
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Deliver the verdict through this notifier (requires a `notify` block)
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Backend matching a pipeline's isolation mode
    pub fn backend_for(&self, isolation: &Isolation) -> Arc<dyn Backend> {
        match isolation {
            Isolation::Host => Arc::new(HostBackend::with_config(HostConfig {
                root_via_sudo: self.config.root_via_sudo,
                ..HostConfig::default()
            })),
            Isolation::Container {
                image_axis,
                keep,
                pull,
                workspace,
            } => Arc::new(ContainerBackend::with_config(
                image_axis.clone(),
                ContainerConfig {
                    keep: *keep,
                    pull_policy: *pull,
                    workspace: workspace.as_ref().map(|mount| WorkspaceMount {
                        // Bind mounts need an absolute host path
                        source: std::path::absolute(&mount.source)
                            .unwrap_or_else(|_| mount.source.clone()),
                        target: mount.target.clone(),
                    }),
                    ..ContainerConfig::default()
                },
            )),
        }
    }

    /// Execute every job of the pipeline and aggregate the verdict
    pub async fn execute(&self, pipeline: Pipeline) -> PipelineResult {
        let start = Instant::now();
        let pipeline = Arc::new(pipeline);
        let mut jobs = MatrixExpander::expand(&pipeline);
        if let Some(commit) = &self.config.commit {
            for job in &mut jobs {
                job.env.insert(COMMIT_ENV.to_string(), commit.clone());
            }
        }
        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| self.backend_for(&pipeline.isolation));

        self.event_tx
            .send_event(ExecutionEvent::pipeline_started(&pipeline.name, jobs.len()));
        tracing::info!(
            pipeline = %pipeline.name,
            jobs = jobs.len(),
            max_parallel = self.config.max_parallel,
            "pipeline started"
        );

        let permits = match self.config.max_parallel {
            0 => jobs.len().max(1),
            n => n,
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut handles = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let runner = {
                let runner = JobRunner::new(pipeline.clone(), job.clone())
                    .with_workers_override(self.config.workers_override);
                match &self.event_tx {
                    Some(tx) => runner.with_progress(tx.clone()),
                    None => runner,
                }
            };
            let backend = backend.clone();
            let semaphore = semaphore.clone();

            handles.push(tokio::spawn(async move {
                // Closed only if the semaphore is dropped, which never happens while tasks run
                let _permit = semaphore.acquire_owned().await.ok();
                runner.run(backend.as_ref()).await
            }));
        }

        let mut aggregator = ResultAggregator::new(&pipeline.name, self.config.commit.clone());
        for (job, handle) in jobs.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(job = job.index, error = %e, "job task failed");
                    self.event_tx.send_event(ExecutionEvent::error(
                        format!("job task failed: {}", e),
                        Some(job.index),
                    ));
                    JobResult::aborted(job, e.to_string())
                }
            };
            aggregator.record(result);
        }

        let target = match (&pipeline.notify, &self.notifier) {
            (Some(definition), Some(notifier)) => Some(NotifyTarget {
                definition,
                notifier: notifier.as_ref(),
            }),
            _ => None,
        };
        let result = aggregator.finish(target, start.elapsed(), &self.event_tx).await;

        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &pipeline.name,
            result.success,
            result.duration,
        ));
        tracing::info!(
            pipeline = %pipeline.name,
            success = result.success,
            duration = ?result.duration,
            "pipeline finished"
        );
        result
    }
}
