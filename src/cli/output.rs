//! CLI output formatting.
//!
//! This module contains all output formatting functions for the CLI.
//! Formatting is split from printing to enable testing of output generation.

use std::fmt::Write;

use crate::config::StudyConfig;
use crate::design::ConditionGrid;
use crate::engine::derive_seed;
use crate::results::ResultsTable;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Print a boxed banner.
pub fn print_banner(title: &str) {
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║ {title:<61} ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");
}

/// Version string including the build's git hash.
#[must_use]
pub fn version_string() -> String {
    format!(
        "cfasim {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("CFASIM_GIT_HASH")
    )
}

/// Print version information.
pub fn print_version() {
    println!("{}", version_string());
}

/// Print help message.
pub fn print_help() {
    println!(
        r"cfasim - Monte Carlo study of CFA fit statistics

USAGE:
    cfasim <COMMAND> [OPTIONS]

COMMANDS:
    run <study.yaml>            Run every condition of a study
        --seed <N>              Override the base seed
        --workers <N>, -j <N>   Number of worker threads
        --parallel <MODE>       sequential | by-condition | by-replication
        --resume                Replay completed conditions from the state file
        --clean                 Discard prior state before running
        -v, --verbose           Debug logging and per-condition details

    validate <study.yaml>       Validate a study file without running it
    clean <study.yaml>          Discard the persisted state of a study
    grid <study.yaml>           Print the condition grid and seeds

    help                        Show this help message
    version                     Show version information

EXAMPLES:
    cfasim grid studies/fit_indices.yaml
    cfasim run studies/fit_indices.yaml --parallel by-condition -j 8
    cfasim run studies/fit_indices.yaml --resume

LOGGING:
    Progress is logged to stderr. Set RUST_LOG (e.g. RUST_LOG=cfasim=debug)
    to change the level.
"
    );
}

/// Study settings as printed before a run and by `validate`.
#[must_use]
pub fn format_study(config: &StudyConfig, grid: &ConditionGrid) -> String {
    let mut out = String::new();
    let name = if config.study.name.is_empty() {
        "(unnamed)"
    } else {
        config.study.name.as_str()
    };
    let _ = writeln!(out, "Study:        {name}");
    if !config.study.description.is_empty() {
        let _ = writeln!(out, "Description:  {}", config.study.description);
    }
    let _ = writeln!(
        out,
        "Conditions:   {} ({} sample sizes x {} model types x {} data types)",
        grid.len(),
        config.factors.sample_size.len(),
        config.factors.model_type.len(),
        config.factors.data_type.len()
    );
    let _ = writeln!(out, "Replications: {}", config.replications);
    let _ = writeln!(out, "Seed:         {}", config.reproducibility.seed);
    let _ = writeln!(out, "Max retries:  {}", config.retry.max_retries_per_replication);
    let _ = writeln!(out, "Parallelism:  {}", config.execution.parallelism);
    if let Some(workers) = config.execution.workers {
        let _ = writeln!(out, "Workers:      {workers}");
    }
    match &config.persistence.state_path {
        Some(path) => {
            let _ = writeln!(
                out,
                "State file:   {}{}",
                path.display(),
                if config.persistence.resume { " (resume)" } else { "" }
            );
        }
        None => {
            let _ = writeln!(out, "State file:   (none, not resumable)");
        }
    }
    out
}

/// Condition grid with row numbers and condition seeds.
#[must_use]
pub fn format_grid(grid: &ConditionGrid, base_seed: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:>6}  {:<13}  {:<10}  {:>20}",
        "#", "n", "model", "data", "seed"
    );
    for (index, condition) in grid.iter() {
        let _ = writeln!(
            out,
            "{:>4}  {:>6}  {:<13}  {:<10}  {:>20}",
            index + 1,
            condition.sample_size,
            condition.model_type.as_str(),
            condition.data_type.as_str(),
            derive_seed(base_seed, index as u64)
        );
    }
    out
}

/// Results table with one line per condition.
#[must_use]
pub fn format_results(table: &ResultsTable) -> String {
    let mut out = String::new();
    let statistics = table
        .rows()
        .first()
        .map(|r| r.statistics.clone())
        .unwrap_or_default();

    let _ = write!(out, "{:>4}  {:>6}  {:<13}  {:<10}", "#", "n", "model", "data");
    for name in &statistics {
        let _ = write!(out, "  {name:>9}");
    }
    let _ = writeln!(out, "  {:>9}  {:>7}", "ok/total", "retries");

    for row in table.rows() {
        let _ = write!(
            out,
            "{:>4}  {:>6}  {:<13}  {:<10}",
            row.index + 1,
            row.condition.sample_size,
            row.condition.model_type.as_str(),
            row.condition.data_type.as_str()
        );
        for mean in &row.means {
            if mean.is_finite() {
                let _ = write!(out, "  {mean:>9.4}");
            } else {
                let _ = write!(out, "  {:>9}", "NA");
            }
        }
        let _ = writeln!(
            out,
            "  {:>9}  {:>7}",
            format!("{}/{}", row.completed, row.replications),
            row.retries
        );
    }
    out
}

/// Print the results table and failure report of a finished study.
pub fn print_results(table: &ResultsTable, verbose: bool) {
    println!("{RULE}");
    println!("Results ({} conditions)", table.len());
    println!("{RULE}\n");
    print!("{}", format_results(table));

    let report = table.failure_report();
    if report.has_issues() || verbose {
        println!();
        print!("{report}");
    }
    if verbose {
        let total: f64 = table.rows().iter().map(|r| r.elapsed.as_secs_f64()).sum();
        println!("\nCompute time: {total:.3}s");
    }
}
