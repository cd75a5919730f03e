use crate::commands::{load_pipeline, DefinitionOverrides};
use crate::output;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use lockstep_service::execution::{ExecutionContext, JobConfig, Provisioner};
use lockstep_service::runners::SYSTEM_PATH;
use lockstep_service::{MatrixExpander, Pipeline};

/// Show what a run would do without running anything
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub overrides: DefinitionOverrides,

    /// Force the worker count of every test suite
    #[arg(long, value_name = "N")]
    pub workers: Option<u32>,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline, &args.overrides)?;
    let jobs = MatrixExpander::expand(&pipeline);

    output::header(&format!("Pipeline '{}' ({} jobs)", pipeline.name, jobs.len()));
    for job in &jobs {
        print_job(&pipeline, job, args.workers);
    }
    Ok(())
}

fn print_job(pipeline: &Pipeline, job: &JobConfig, workers: Option<u32>) {
    let base_env = BTreeMap::from([("PATH".to_string(), SYSTEM_PATH.to_string())]);
    let ctx = ExecutionContext::new(job, base_env, pipeline.forward_env.clone());
    let identity = &job.identity;

    println!();
    println!("Job {}: {}", job.index, job.name);
    println!(
        "  identity: {} (uid {}, gid {}, home {})",
        identity.user, identity.uid, identity.gid, identity.home
    );

    println!("  provision:");
    for planned in Provisioner::new(&pipeline.provision).plan(&ctx) {
        println!("    [{}] {}", planned.stage, ctx.expand(&planned.step.script));
    }

    for (label, steps) in [("lint", &pipeline.lint), ("install", &pipeline.install)] {
        if steps.is_empty() {
            continue;
        }
        println!("  {}:", label);
        for step in steps {
            println!(
                "    {} as {}: {}",
                step.name,
                step.run_as,
                ctx.invocation_for(step).shell_script()
            );
        }
    }

    if !pipeline.suites.is_empty() {
        println!("  tests:");
        for suite in &pipeline.suites {
            let command = ctx.expand(&suite.command_line(workers));
            match &suite.tree {
                Some(tree) => println!("    {}: cd {} && {}", suite.name, ctx.expand(tree), command),
                None => println!("    {}: {}", suite.name, command),
            }
        }
    }
}
