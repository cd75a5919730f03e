use crate::commands::{load_pipeline, DefinitionOverrides};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use lockstep_service::{Isolation, MatrixExpander};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub overrides: DefinitionOverrides,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.display()));

    let pipeline = load_pipeline(&args.pipeline, &args.overrides)?;
    output::check("YAML syntax valid");
    output::check("Semantic validation passed");

    let jobs = MatrixExpander::expand(&pipeline);
    let axes = pipeline
        .axes
        .iter()
        .map(|axis| format!("{} ({})", axis.name, axis.values.len()))
        .collect::<Vec<_>>()
        .join(" x ");
    output::check(&format!(
        "Matrix: {} = {} combinations -> {} jobs ({} excluded, {} included)",
        axes,
        pipeline.product_size(),
        jobs.len(),
        pipeline.exclude.len(),
        pipeline.include.len()
    ));

    let isolation = match &pipeline.isolation {
        Isolation::Host => "host".to_string(),
        Isolation::Container {
            image_axis,
            keep,
            workspace,
            ..
        } => format!(
            "container (image axis {}{}{})",
            image_axis,
            workspace
                .as_ref()
                .map(|mount| format!(", {} at {}", mount.source.display(), mount.target))
                .unwrap_or_default(),
            if *keep { ", kept" } else { "" }
        ),
    };
    output::check(&format!("Isolation: {}", isolation));
    output::check(&format!(
        "Phases: {} setup, {} lint, {} install steps, {} suites",
        pipeline.provision.setup.len(),
        pipeline.lint.len(),
        pipeline.install.len(),
        pipeline.suites.len()
    ));
    if let Some(notify) = &pipeline.notify {
        output::check(&format!(
            "Notify: {} (webhook from {})",
            notify.channel, notify.webhook_env
        ));
    }

    eprintln!();
    output::success(&format!("Pipeline '{}' is valid", pipeline.name));
    Ok(())
}
