mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Run matrix build-and-test pipelines under a provisioned, unprivileged identity
#[derive(Parser, Debug)]
#[command(name = "lockstep", version, about)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence when set)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every job of a pipeline and report the verdict
    Run(commands::run::RunArgs),
    /// Parse and validate a pipeline without running it
    Validate(commands::validate::ValidateArgs),
    /// Print the expanded jobs and the commands each would run
    Plan(commands::plan::PlanArgs),
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Plan(args) => commands::plan::execute(args),
    }
}
