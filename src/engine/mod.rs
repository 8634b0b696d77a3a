//! Simulation engine.
//!
//! Orchestrates the condition grid, the replication runner and the
//! aggregator:
//! - Deterministic seeds (one derived stream per condition, replication and
//!   attempt; no shared RNG)
//! - Resumable progress through the persisted [`StateStore`]
//! - Parallelism across conditions or across replications on a
//!   work-stealing pool, with results always joined in grid order
//! - Cooperative cancellation between conditions

pub mod aggregate;
pub mod rng;
pub mod runner;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use aggregate::Aggregator;
pub use rng::{derive_seed, SimRng};
pub use runner::{ConditionRun, ReplicationOutcome, ReplicationResult, ReplicationRunner};
pub use scheduler::WorkerPool;

use crate::design::{Condition, ConditionGrid};
use crate::domains::{DataGenerator, ModelFitter};
use crate::error::{SimError, SimResult};
use crate::replay::{StateStore, StudyIdentity};
use crate::results::ResultsTable;

/// How work is spread over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Parallelism {
    /// Everything on the calling thread.
    #[default]
    Sequential,
    /// Whole conditions run concurrently.
    ByCondition,
    /// Conditions run in order; their replications run concurrently.
    ByReplication,
}

impl Parallelism {
    /// Lower-case kebab name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::ByCondition => "by-condition",
            Self::ByReplication => "by-replication",
        }
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parallelism {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "sequential" | "none" => Ok(Self::Sequential),
            "by-condition" | "condition" | "conditions" => Ok(Self::ByCondition),
            "by-replication" | "replication" | "replications" => Ok(Self::ByReplication),
            other => Err(SimError::config(format!(
                "unknown parallelism '{other}' (expected sequential, by-condition or by-replication)"
            ))),
        }
    }
}

/// Run-level settings of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Replications per condition.
    pub replications: u32,
    /// Base seed all condition seeds derive from.
    pub base_seed: u64,
    /// Retries per replication after a recoverable failure.
    pub max_retries: u32,
    /// Thread layout.
    pub parallelism: Parallelism,
    /// Worker threads; `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Replay completed conditions from the state file.
    pub resume: bool,
    /// State file; `None` keeps progress in memory only.
    pub state_path: Option<PathBuf>,
    /// Description of the generator/fitter setup, part of the state
    /// fingerprint.
    pub context: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replications: 500,
            base_seed: 42,
            max_retries: 0,
            parallelism: Parallelism::Sequential,
            workers: None,
            resume: false,
            state_path: None,
            context: String::new(),
        }
    }
}

impl EngineConfig {
    fn identity(&self) -> StudyIdentity {
        StudyIdentity {
            base_seed: self.base_seed,
            replications: self.replications,
            max_retries: self.max_retries,
            context: self.context.clone(),
        }
    }

    fn pool(&self) -> WorkerPool {
        self.workers
            .map_or_else(WorkerPool::new, WorkerPool::with_workers)
    }
}

/// Pending unit of work: row index, condition, condition seed.
type Task = (usize, Condition, u64);

/// Runs a whole study: every condition of a grid, resumable and optionally
/// parallel.
///
/// # Example
///
/// ```rust
/// use cfasim::prelude::*;
///
/// let model = PopulationModel::default();
/// let engine = SimulationEngine::new(
///     PopulationGenerator::new(model.clone()),
///     SurrogateFitter::new(model),
///     EngineConfig { replications: 5, ..EngineConfig::default() },
/// );
/// let grid = ConditionGrid::build(&FactorLevels {
///     sample_size: vec![50],
///     ..FactorLevels::default()
/// })
/// .unwrap();
///
/// let table = engine.run(&grid).unwrap();
/// assert_eq!(table.len(), 4);
/// ```
pub struct SimulationEngine<'a> {
    generator: Box<dyn DataGenerator + 'a>,
    fitter: Box<dyn ModelFitter + 'a>,
    aggregator: Aggregator,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
}

impl<'a> SimulationEngine<'a> {
    /// Create an engine over a data generator and a model fitter.
    pub fn new<G, F>(generator: G, fitter: F, config: EngineConfig) -> Self
    where
        G: DataGenerator + 'a,
        F: ModelFitter + 'a,
    {
        Self {
            generator: Box::new(generator),
            fitter: Box::new(fitter),
            aggregator: Aggregator::default(),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the aggregator (for fitters with a non-standard layout).
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Share an externally owned stop flag, e.g. one set by a signal
    /// handler.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Engine settings.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared stop flag. Setting it lets in-flight conditions finish and
    /// starts no new ones.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Discard the state file, if any. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be removed.
    pub fn clean(&self) -> SimResult<bool> {
        match &self.config.state_path {
            Some(path) => StateStore::discard(path),
            None => Ok(false),
        }
    }

    /// Run every condition of `grid` and return one row per condition, in
    /// grid order.
    ///
    /// With `resume`, conditions completed by an earlier run are replayed
    /// from the state file and only pending ones are computed; otherwise
    /// any earlier state is discarded first.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The study is misconfigured (zero replications, fatal replication
    ///   error, mismatched fit layout)
    /// - The state file is inconsistent with the study
    /// - The state file cannot be written
    /// - The run was cancelled before every condition completed
    pub fn run(&self, grid: &ConditionGrid) -> SimResult<ResultsTable> {
        if self.config.replications == 0 {
            return Err(SimError::config("replications must be positive"));
        }
        if grid.is_empty() {
            return Err(SimError::config("condition grid is empty"));
        }

        let identity = self.config.identity();
        let store = match (&self.config.state_path, self.config.resume) {
            (Some(path), true) => StateStore::resume(path, grid, &identity)?,
            (Some(path), false) => StateStore::create(path, grid, &identity)?,
            (None, _) => StateStore::in_memory(grid, &identity)?,
        };
        store.check_layout(self.aggregator.layout())?;

        let tasks: Vec<Task> = store
            .pending()
            .map(|r| (r.index, r.condition, r.seed))
            .collect();
        tracing::info!(
            conditions = grid.len(),
            replayed = store.completed_count(),
            pending = tasks.len(),
            replications = self.config.replications,
            parallelism = %self.config.parallelism,
            "starting study"
        );

        let store = Mutex::new(store);
        match self.config.parallelism {
            Parallelism::Sequential => {
                for task in &tasks {
                    if self.cancelled() {
                        break;
                    }
                    self.run_task(task, None, &store, grid.len())?;
                }
            }
            Parallelism::ByReplication => {
                let pool = self.config.pool();
                for task in &tasks {
                    if self.cancelled() {
                        break;
                    }
                    self.run_task(task, Some(&pool), &store, grid.len())?;
                }
            }
            Parallelism::ByCondition => {
                let pool = self.config.pool();
                let aborted = AtomicBool::new(false);
                let results = pool.execute(tasks.len(), |i| {
                    if self.cancelled() || aborted.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self.run_task(&tasks[i], None, &store, grid.len());
                    if result.is_err() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                });
                // First error in grid order wins.
                results.into_iter().flatten().collect::<SimResult<Vec<()>>>()?;
            }
        }

        let store = store.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !store.is_complete() {
            let completed = store.completed_count();
            tracing::warn!(completed, total = grid.len(), "study cancelled");
            return Err(SimError::Cancelled {
                completed,
                total: grid.len(),
            });
        }

        let table = store.table();
        let fully_failed = table.fully_failed().count();
        tracing::info!(conditions = table.len(), fully_failed, "study finished");
        Ok(table)
    }

    fn run_task(
        &self,
        &(index, condition, seed): &Task,
        pool: Option<&WorkerPool>,
        store: &Mutex<StateStore>,
        total: usize,
    ) -> SimResult<()> {
        let runner = ReplicationRunner::new(
            self.generator.as_ref(),
            self.fitter.as_ref(),
            self.config.max_retries,
        );
        let replications = self.config.replications;
        let run = match pool {
            Some(pool) => runner.run_on(pool, index, &condition, seed, replications)?,
            None => runner.run(index, &condition, seed, replications)?,
        };
        let summary = self.aggregator.summarize(&run)?;

        if summary.fully_failed {
            tracing::warn!(
                condition = %condition,
                failed = summary.failed,
                "condition fully failed, statistics undefined"
            );
        }
        let elapsed_ms = summary.elapsed.as_millis();

        let done = {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            store.record_completed(summary)?;
            store.completed_count()
        };
        tracing::info!(
            row = index + 1,
            condition = %condition,
            done,
            total,
            elapsed_ms,
            "condition completed"
        );
        Ok(())
    }
}
