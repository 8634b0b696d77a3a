//! # cfasim
//!
//! Reproducible Monte Carlo study of confirmatory factor analysis (CFA) fit
//! statistics under varying sample size, model misspecification and data
//! non-normality.
//!
//! A study crosses its factor levels into a [`design::ConditionGrid`], runs
//! N independent (generate → fit) replications per condition with failure
//! isolation and bounded retries, averages the fit statistics per condition
//! and assembles a [`results::ResultsTable`]:
//! - Seed It: every condition, replication and retry draws from its own
//!   derived stream, so identical inputs give bit-identical tables
//!   regardless of thread count
//! - Resume It: per-condition progress is persisted atomically and replayed
//!   on restart
//! - Poka-Yoke: YAML studies are schema- and semantically validated before
//!   anything runs
//!
//! ## Example
//!
//! ```rust
//! use cfasim::prelude::*;
//!
//! let config = StudyConfig::builder()
//!     .seed(42)
//!     .replications(3)
//!     .factors(FactorLevels {
//!         sample_size: vec![80],
//!         ..FactorLevels::default()
//!     })
//!     .build();
//!
//! let grid = config.grid().unwrap();
//! let engine = SimulationEngine::new(
//!     PopulationGenerator::new(config.population.clone()),
//!     SurrogateFitter::new(config.population.clone()),
//!     config.engine_config().unwrap(),
//! );
//! let table = engine.run(&grid).unwrap();
//! assert_eq!(table.len(), 4);
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::suboptimal_flops,  // Written-out formulas follow the textbook definitions
    clippy::imprecise_flops,
    clippy::many_single_char_names,  // Matrix code uses i, j, k, n, p
    clippy::too_many_lines,
    clippy::missing_const_for_fn,
    clippy::needless_range_loop,   // Index loops over symmetric matrices
)]

pub mod cli;
pub mod config;
pub mod design;
pub mod domains;
pub mod engine;
pub mod error;
pub mod replay;
pub mod results;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{StudyConfig, StudyConfigBuilder};
    pub use crate::design::{Condition, ConditionGrid, DataType, FactorLevels, ModelType};
    pub use crate::domains::cfa::{PopulationGenerator, PopulationModel, SurrogateFitter};
    pub use crate::domains::{DataGenerator, Dataset, FitVector, FittedModel, ModelFitter};
    pub use crate::engine::rng::SimRng;
    pub use crate::engine::{Aggregator, EngineConfig, Parallelism, ReplicationRunner, SimulationEngine};
    pub use crate::error::{ReplicationError, SimError, SimResult};
    pub use crate::results::{ConditionSummary, ResultsTable};
}

/// Re-export for public API
pub use error::{SimError, SimResult};
