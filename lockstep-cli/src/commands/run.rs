use crate::commands::{load_pipeline, DefinitionOverrides};
use crate::output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use lockstep_service::execution::events::LogLevel;
use lockstep_service::execution::{NotificationOutcome, Status};
use lockstep_service::{
    progress_channel, ExecutionEvent, ExecutorConfig, PipelineExecutor, PipelineResult, Reporter,
    WebhookNotifier,
};

/// Run a pipeline: every matrix job, then the verdict notification
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub overrides: DefinitionOverrides,

    /// Maximum jobs running at once (0 = all at once)
    #[arg(long, env = "LOCKSTEP_MAX_PARALLEL", default_value_t = 0, value_name = "N")]
    pub max_parallel: usize,

    /// Commit under test: exported to every job as COMMIT and reported in the verdict
    #[arg(long, env = "LOCKSTEP_COMMIT", value_name = "REF")]
    pub commit: Option<String>,

    /// Force the worker count of every test suite
    #[arg(long, value_name = "N")]
    pub workers: Option<u32>,

    /// Run root steps on the host through sudo
    #[arg(long)]
    pub root_via_sudo: bool,

    /// Write suite results as JUnit XML
    #[arg(long, value_name = "FILE")]
    pub junit: Option<PathBuf>,

    /// Write the full pipeline result as JSON
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Do not send the completion notification
    #[arg(long)]
    pub no_notify: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::status("Loading", &format!("{}", args.pipeline.display()));
    let pipeline = load_pipeline(&args.pipeline, &args.overrides)?;

    let config = ExecutorConfig {
        max_parallel: args.max_parallel,
        commit: args.commit.clone(),
        workers_override: args.workers,
        root_via_sudo: args.root_via_sudo,
    };

    let (tx, mut rx) = progress_channel();
    let mut executor = PipelineExecutor::new(config).with_progress(tx);

    match (&pipeline.notify, args.no_notify) {
        (Some(_), true) => output::info("Notification disabled (--no-notify)"),
        (Some(definition), false) => match WebhookNotifier::from_definition(definition)? {
            Some(notifier) => executor = executor.with_notifier(Arc::new(notifier)),
            None => output::warning(&format!(
                "{} is not set; notification to {} disabled",
                definition.webhook_env, definition.channel
            )),
        },
        (None, _) => {}
    }

    tracing::debug!(pipeline = %pipeline.name, "starting executor");
    let exec_handle = tokio::spawn(async move { executor.execute(pipeline).await });

    while let Some(event) = rx.recv().await {
        render_event(&event);
    }

    let result = exec_handle.await?;

    if let Some(path) = &args.junit {
        write_report(path, &Reporter::to_junit_xml(&result))?;
    }
    if let Some(path) = &args.json {
        write_report(path, &Reporter::to_json(&result)?)?;
    }

    eprint!("{}", Reporter::to_terminal(&result));
    finish(&result);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn write_report(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .wrap_err_with(|| format!("failed to write report to {}", path.display()))?;
    output::info(&format!("Report written to {}", path.display()));
    Ok(())
}

fn finish(result: &PipelineResult) {
    match &result.notification {
        NotificationOutcome::Sent { channel } => output::check(&format!("Notified {}", channel)),
        NotificationOutcome::Failed { channel, error } => {
            output::warning(&format!("Notification to {} failed: {}", channel, error))
        }
        NotificationOutcome::Disabled => {}
    }

    let at = result
        .commit
        .as_deref()
        .map(|commit| format!(" at {}", commit))
        .unwrap_or_default();
    if result.success {
        output::success(&format!(
            "Pipeline '{}' passed{} in {:.2}s",
            result.pipeline,
            at,
            result.duration.as_secs_f64()
        ));
    } else {
        output::failure(&format!(
            "Pipeline '{}' failed{} after {:.2}s",
            result.pipeline,
            at,
            result.duration.as_secs_f64()
        ));
    }
}

fn status_color(status: Status) -> fn(&str) {
    match status {
        Status::Succeeded => output::dim_success,
        Status::Failed => output::dim_failure,
        Status::Skipped => output::dim,
    }
}

fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_jobs,
        } => {
            eprintln!();
            output::header(&format!("Pipeline '{}' ({} jobs)", pipeline_name, total_jobs));
        }

        ExecutionEvent::PipelineCompleted { .. } => eprintln!(),

        ExecutionEvent::JobStarted {
            job_index,
            job_name,
        } => output::job_header(*job_index, job_name),

        ExecutionEvent::JobStateChanged { job_index, state } => {
            tracing::debug!(job = job_index, state = %state, "job state changed");
        }

        ExecutionEvent::JobCompleted {
            job_index,
            job_name,
            success,
            failure,
            duration,
        } => {
            if *success {
                output::dim_success(&format!(
                    "  [{}] Job '{}' OK ({:.2}s)",
                    job_index,
                    job_name,
                    duration.as_secs_f64()
                ));
            } else {
                output::dim_failure(&format!(
                    "  [{}] Job '{}' FAIL ({:.2}s): {}",
                    job_index,
                    job_name,
                    duration.as_secs_f64(),
                    failure.as_deref().unwrap_or("failed")
                ));
            }
        }

        ExecutionEvent::PhaseStarted {
            job_index,
            phase,
            total_steps,
        } => eprintln!("  [{}] {} ({} steps)", job_index, phase, total_steps),

        ExecutionEvent::PhaseCompleted {
            job_index,
            phase,
            status,
            duration,
        } => status_color(*status)(&format!(
            "  [{}] {} {} ({:.2}s)",
            job_index,
            phase,
            status,
            duration.as_secs_f64()
        )),

        ExecutionEvent::PhaseSkipped {
            job_index,
            phase,
            reason,
        } => output::warning(&format!("[{}] {} skipped: {}", job_index, phase, reason)),

        ExecutionEvent::StepStarted {
            job_index,
            step_name,
            step_index,
            ..
        } => eprintln!("  [{}]   [Step {}] {}", job_index, step_index + 1, step_name),

        ExecutionEvent::StepOutput {
            job_index,
            output,
            is_error,
            ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(*job_index, line);
                } else {
                    output::step_output(*job_index, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            job_index,
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            status_color(*status)(&format!(
                "  [{}]     {} ({:.2}s){}",
                job_index,
                status,
                duration.as_secs_f64(),
                exit_info
            ));
        }

        ExecutionEvent::StepSkipped {
            job_index,
            step_name,
            reason,
            ..
        } => output::warning(&format!("[{}]   {} skipped: {}", job_index, step_name, reason)),

        ExecutionEvent::EnvChanged {
            job_index,
            name,
            value,
        } => output::dim(&format!("  [{}]     [env] {} = {}", job_index, name, value)),

        ExecutionEvent::SuiteStarted {
            job_index,
            suite_name,
            workers,
        } => {
            let workers = workers
                .map(|n| format!(" ({} workers)", n))
                .unwrap_or_default();
            eprintln!("  [{}]   Suite '{}'{}", job_index, suite_name, workers);
        }

        ExecutionEvent::SuiteCompleted {
            job_index,
            suite_name,
            status,
            duration,
            exit_code,
        } => status_color(*status)(&format!(
            "  [{}]   Suite '{}' {} ({:.2}s, exit code: {:?})",
            job_index,
            suite_name,
            status,
            duration.as_secs_f64(),
            exit_code
        )),

        ExecutionEvent::SuiteSkipped {
            job_index,
            suite_name,
            reason,
        } => output::warning(&format!(
            "[{}]   Suite '{}' skipped: {}",
            job_index, suite_name, reason
        )),

        ExecutionEvent::NotificationSent { channel } => {
            tracing::debug!(channel = %channel, "notification sent");
        }

        ExecutionEvent::NotificationFailed { channel, message } => {
            tracing::debug!(channel = %channel, error = %message, "notification failed");
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Info | LogLevel::Debug => output::dim(message),
        },
    }
}
