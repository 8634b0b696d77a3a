//! cfasim CLI - CFA fit statistics simulation
//!
//! Command-line interface for running simulation studies.

use std::process::ExitCode;

use cfasim::cli::{run_cli, Args};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose() { "cfasim=debug" } else { "cfasim=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    run_cli(args)
}
