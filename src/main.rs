mod cli;
mod commands;
mod errors;
mod harness;
mod model;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::errors::EvalError;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose());

    if let Err(err) = run(cli) {
        let code = err
            .downcast_ref::<EvalError>()
            .map_or("internal", EvalError::code);
        error!(error = %err, code, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Experiments(args) => commands::experiments::run(args),
        Commands::Compare(args) => commands::compare::run(args),
        Commands::Manifest(args) => commands::manifest::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
