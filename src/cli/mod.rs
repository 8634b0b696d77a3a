//! CLI module for cfasim.
//!
//! This module contains all CLI logic extracted from main.rs to enable
//! full test coverage. The entry point `run_cli` can be called from main.rs
//! with parsed arguments.

mod args;
mod commands;
mod output;

pub use args::{Args, Command, RunOptions};
pub use commands::{apply_overrides, execute_study, run_cli};
pub use output::{format_grid, format_results, format_study, print_help, print_version};
