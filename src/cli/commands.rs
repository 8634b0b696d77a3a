//! CLI command handlers.
//!
//! This module contains the execution logic for each CLI command.
//! Extracted to enable comprehensive testing of command behavior.

use std::path::Path;
use std::process::ExitCode;

use crate::config::StudyConfig;
use crate::domains::cfa::{PopulationGenerator, SurrogateFitter};
use crate::engine::SimulationEngine;
use crate::error::{SimError, SimResult};
use crate::replay::StateStore;
use crate::results::ResultsTable;

use super::output::{format_grid, format_study, print_banner, print_help, print_results, print_version};
use super::{Args, Command, RunOptions};

/// Main CLI entry point.
///
/// Dispatches to the appropriate command handler based on parsed arguments.
#[must_use]
pub fn run_cli(args: Args) -> ExitCode {
    match args.command {
        Command::Run {
            study_path,
            options,
        } => run_study(&study_path, &options),
        Command::Validate { study_path } => validate_study(&study_path),
        Command::Clean { study_path } => clean_study(&study_path),
        Command::Grid { study_path } => show_grid(&study_path),
        Command::Help => {
            print_help();
            ExitCode::SUCCESS
        }
        Command::Version => {
            print_version();
            ExitCode::SUCCESS
        }
    }
}

/// Exit code for a failed command: 2 for configuration problems, 1 for
/// everything else.
fn failure(err: &SimError) -> ExitCode {
    eprintln!("Error: {err}");
    if err.is_configuration() {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

/// Apply command-line overrides to a loaded study.
///
/// # Errors
///
/// Returns error if the overridden study no longer validates.
pub fn apply_overrides(mut config: StudyConfig, options: &RunOptions) -> SimResult<StudyConfig> {
    if let Some(seed) = options.seed_override {
        config.reproducibility.seed = seed;
    }
    if let Some(workers) = options.workers {
        config.execution.workers = Some(workers);
    }
    if let Some(parallelism) = options.parallelism {
        config.execution.parallelism = parallelism;
    }
    if options.resume {
        config.persistence.resume = true;
    }
    if options.clean {
        config.persistence.resume = false;
    }
    config.validate_all()?;
    Ok(config)
}

/// Run a study with the surrogate CFA backend and write its exports.
///
/// # Errors
///
/// Returns error if the study is misconfigured, its state cannot be
/// resumed, or an export cannot be written.
pub fn execute_study(config: &StudyConfig) -> SimResult<ResultsTable> {
    let grid = config.grid()?;
    let engine = SimulationEngine::new(
        PopulationGenerator::new(config.population.clone()),
        SurrogateFitter::new(config.population.clone()),
        config.engine_config()?,
    );

    let table = engine.run(&grid)?;

    if let Some(path) = &config.persistence.output_csv {
        table.save_csv(path)?;
        tracing::info!(path = %path.display(), "wrote CSV results");
    }
    if let Some(path) = &config.persistence.output_json {
        table.save_json(path)?;
        tracing::info!(path = %path.display(), "wrote JSON results");
    }
    Ok(table)
}

/// Run a study from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the study YAML file
/// * `options` - Command-line overrides
#[must_use]
pub fn run_study(path: &Path, options: &RunOptions) -> ExitCode {
    print_banner("cfasim - CFA Fit Statistics Simulation");

    let config = match StudyConfig::load(path).and_then(|c| apply_overrides(c, options)) {
        Ok(config) => config,
        Err(e) => return failure(&e),
    };
    let grid = match config.grid() {
        Ok(grid) => grid,
        Err(e) => return failure(&e),
    };

    println!("Running study: {}\n", path.display());
    print!("{}", format_study(&config, &grid));
    println!();

    match execute_study(&config) {
        Ok(table) => {
            print_results(&table, options.verbose);
            if let Some(path) = &config.persistence.output_csv {
                println!("\n✓ CSV written to {}", path.display());
            }
            if let Some(path) = &config.persistence.output_json {
                println!("✓ JSON written to {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => failure(&e),
    }
}

/// Validate a study file without running it.
///
/// # Arguments
///
/// * `path` - Path to the study YAML file
#[must_use]
pub fn validate_study(path: &Path) -> ExitCode {
    print_banner("cfasim - Study Validation");
    println!("Validating: {}\n", path.display());

    let checked = StudyConfig::load(path).and_then(|config| {
        let grid = config.grid()?;
        config.engine_config()?;
        Ok((config, grid))
    });

    match checked {
        Ok((config, grid)) => {
            print!("{}", format_study(&config, &grid));
            println!("\n✓ Study is valid");
            println!("\nNext steps:");
            println!("  • Inspect: cfasim grid {}", path.display());
            println!("  • Run:     cfasim run {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("✗ Study is invalid");
            failure(&e)
        }
    }
}

/// Discard the persisted state of a study.
///
/// # Arguments
///
/// * `path` - Path to the study YAML file
#[must_use]
pub fn clean_study(path: &Path) -> ExitCode {
    let config = match StudyConfig::load(path) {
        Ok(config) => config,
        Err(e) => return failure(&e),
    };

    let Some(state_path) = &config.persistence.state_path else {
        println!("Study has no state file; nothing to clean.");
        return ExitCode::SUCCESS;
    };

    match StateStore::discard(state_path) {
        Ok(true) => {
            println!("✓ Removed {}", state_path.display());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("No state at {}; nothing to clean.", state_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => failure(&e),
    }
}

/// Print the condition grid of a study.
///
/// # Arguments
///
/// * `path` - Path to the study YAML file
#[must_use]
pub fn show_grid(path: &Path) -> ExitCode {
    match StudyConfig::load(path).and_then(|config| Ok((config.grid()?, config))) {
        Ok((grid, config)) => {
            print!("{}", format_grid(&grid, config.reproducibility.seed));
            ExitCode::SUCCESS
        }
        Err(e) => failure(&e),
    }
}
