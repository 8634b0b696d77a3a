//! CLI argument parsing.
//!
//! This module provides the argument parser for the cfasim CLI.
//! Extracted to enable comprehensive testing of argument parsing logic.

use std::path::PathBuf;

use crate::engine::Parallelism;

/// CLI arguments container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// The command to execute.
    pub command: Command,
}

/// Overrides applied to a study before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Base seed override.
    pub seed_override: Option<u64>,
    /// Worker count override.
    pub workers: Option<usize>,
    /// Parallelism override.
    pub parallelism: Option<Parallelism>,
    /// Replay completed conditions from the state file.
    pub resume: bool,
    /// Discard prior state before running.
    pub clean: bool,
    /// Enable verbose output.
    pub verbose: bool,
}

/// Available CLI commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a study
    Run {
        /// Path to the study YAML file.
        study_path: PathBuf,
        /// Overrides.
        options: RunOptions,
    },
    /// Validate a study file without running it
    Validate {
        /// Path to the study YAML file.
        study_path: PathBuf,
    },
    /// Discard the persisted state of a study
    Clean {
        /// Path to the study YAML file.
        study_path: PathBuf,
    },
    /// Print the condition grid of a study
    Grid {
        /// Path to the study YAML file.
        study_path: PathBuf,
    },
    /// Show help
    Help,
    /// Show version
    Version,
}

impl Args {
    /// Parse command-line arguments from an iterator.
    ///
    /// This method is testable as it accepts any iterator of strings,
    /// not just `std::env::args()`.
    #[must_use]
    pub fn parse_from<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::parse_from_vec(&args)
    }

    /// Parse command-line arguments from the environment.
    #[must_use]
    pub fn parse() -> Self {
        Self::parse_from(std::env::args())
    }

    /// Whether verbose output was requested.
    #[must_use]
    pub const fn verbose(&self) -> bool {
        matches!(
            self.command,
            Command::Run {
                options: RunOptions { verbose: true, .. },
                ..
            }
        )
    }

    /// Internal parsing from a vector of strings.
    fn parse_from_vec(args: &[String]) -> Self {
        if args.len() < 2 {
            return Self {
                command: Command::Help,
            };
        }

        let command = match args[1].as_str() {
            "run" => Self::parse_run_command(args),
            "validate" => Self::parse_path_command(args, "validate", |study_path| {
                Command::Validate { study_path }
            }),
            "clean" => {
                Self::parse_path_command(args, "clean", |study_path| Command::Clean { study_path })
            }
            "grid" => {
                Self::parse_path_command(args, "grid", |study_path| Command::Grid { study_path })
            }
            "-h" | "--help" | "help" => Command::Help,
            "-V" | "--version" | "version" => Command::Version,
            unknown => {
                eprintln!("Unknown command: {unknown}");
                Command::Help
            }
        };

        Self { command }
    }

    /// Parse the 'run' command arguments.
    fn parse_run_command(args: &[String]) -> Command {
        if args.len() < 3 || args[2].starts_with('-') {
            eprintln!("Error: 'run' command requires a study path");
            return Command::Help;
        }

        let mut options = RunOptions::default();

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--seed" => {
                    let value = option_value(args, i);
                    if let Some(seed) = value.and_then(|s| s.parse().ok()) {
                        options.seed_override = Some(seed);
                    } else {
                        eprintln!("Warning: ignoring --seed without a valid value");
                    }
                    i += 1 + usize::from(value.is_some());
                }
                "--workers" | "-j" => {
                    let value = option_value(args, i);
                    match value.and_then(|s| s.parse::<usize>().ok()) {
                        Some(n) if n > 0 => options.workers = Some(n),
                        _ => eprintln!("Warning: ignoring --workers without a positive value"),
                    }
                    i += 1 + usize::from(value.is_some());
                }
                "--parallel" => {
                    let value = option_value(args, i);
                    match value.map(str::parse::<Parallelism>) {
                        Some(Ok(mode)) => options.parallelism = Some(mode),
                        Some(Err(e)) => eprintln!("Warning: {e}"),
                        None => eprintln!("Warning: ignoring --parallel without a mode"),
                    }
                    i += 1 + usize::from(value.is_some());
                }
                "--resume" => {
                    options.resume = true;
                    i += 1;
                }
                "--clean" => {
                    options.clean = true;
                    i += 1;
                }
                "-v" | "--verbose" => {
                    options.verbose = true;
                    i += 1;
                }
                other => {
                    eprintln!("Warning: ignoring unknown option {other}");
                    i += 1;
                }
            }
        }

        if options.resume && options.clean {
            eprintln!("Error: --resume and --clean cannot be combined");
            return Command::Help;
        }

        Command::Run {
            study_path: PathBuf::from(&args[2]),
            options,
        }
    }

    /// Parse a command whose only argument is a study path.
    fn parse_path_command(args: &[String], name: &str, make: fn(PathBuf) -> Command) -> Command {
        if args.len() < 3 {
            eprintln!("Error: '{name}' command requires a study path");
            return Command::Help;
        }
        make(PathBuf::from(&args[2]))
    }
}

/// Value following the flag at `i`, unless the next token is another flag.
fn option_value(args: &[String], i: usize) -> Option<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .filter(|s| !s.starts_with('-'))
}
