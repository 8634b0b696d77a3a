//! Replication runner: N independent (generate → fit) replications of one
//! condition.
//!
//! Every attempt draws from its own stream: the replication seed is derived
//! from the condition seed and the replication index, and each retry derives
//! a fresh stream from that. Recoverable failures are retried up to
//! `max_retries` times and then recorded; fatal failures abort the run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::design::Condition;
use crate::domains::{DataGenerator, FitVector, ModelFitter};
use crate::engine::rng::{derive_seed, SimRng};
use crate::engine::scheduler::WorkerPool;
use crate::error::{ReplicationError, SimError, SimResult};

/// Result of one replication after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationResult {
    /// The fit succeeded.
    Success {
        /// Fit statistics.
        stats: FitVector,
        /// Estimation warnings.
        warnings: Vec<String>,
    },
    /// Every attempt failed with a recoverable error; holds the last one.
    Failed(ReplicationError),
}

/// One replication with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOutcome {
    /// Replication index within the condition, from 0.
    pub index: u32,
    /// Attempts made (1 + retries).
    pub attempts: u32,
    /// Final result.
    pub result: ReplicationResult,
}

/// All replications of one condition.
#[derive(Debug, Clone)]
pub struct ConditionRun {
    /// Row index of the condition.
    pub index: usize,
    /// The condition.
    pub condition: Condition,
    /// Condition seed.
    pub seed: u64,
    /// Replication outcomes, ordered by replication index.
    pub outcomes: Vec<ReplicationOutcome>,
    /// Wall-clock time of all replications.
    pub elapsed: Duration,
}

impl ConditionRun {
    /// Replications requested.
    #[must_use]
    pub fn replications(&self) -> u32 {
        self.outcomes.len() as u32
    }

    /// Successful fit vectors with their replication index.
    pub fn successes(&self) -> impl Iterator<Item = (u32, &FitVector)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            ReplicationResult::Success { stats, .. } => Some((o.index, stats)),
            ReplicationResult::Failed(_) => None,
        })
    }

    /// Number of successful replications.
    #[must_use]
    pub fn completed(&self) -> u32 {
        self.successes().count() as u32
    }

    /// Number of permanently failed replications.
    #[must_use]
    pub fn failed(&self) -> u32 {
        self.replications() - self.completed()
    }

    /// Extra attempts spent on retries.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.outcomes.iter().map(|o| o.attempts - 1).sum()
    }

    /// Estimation warnings over successful replications.
    #[must_use]
    pub fn warnings(&self) -> u32 {
        self.outcomes
            .iter()
            .map(|o| match &o.result {
                ReplicationResult::Success { warnings, .. } => warnings.len() as u32,
                ReplicationResult::Failed(_) => 0,
            })
            .sum()
    }

    /// Permanent failures grouped by kind.
    #[must_use]
    pub fn failures_by_kind(&self) -> BTreeMap<String, u32> {
        let mut kinds = BTreeMap::new();
        for outcome in &self.outcomes {
            if let ReplicationResult::Failed(err) = &outcome.result {
                *kinds.entry(err.kind().to_string()).or_insert(0) += 1;
            }
        }
        kinds
    }
}

/// Runs the replications of a condition against a generator and a fitter.
pub struct ReplicationRunner<'a> {
    generator: &'a dyn DataGenerator,
    fitter: &'a dyn ModelFitter,
    max_retries: u32,
}

impl<'a> ReplicationRunner<'a> {
    /// Create a runner retrying each recoverable failure up to `max_retries`
    /// times.
    #[must_use]
    pub fn new(generator: &'a dyn DataGenerator, fitter: &'a dyn ModelFitter, max_retries: u32) -> Self {
        Self {
            generator,
            fitter,
            max_retries,
        }
    }

    /// Run `replications` replications one after another.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a replication fails fatally.
    pub fn run(
        &self,
        index: usize,
        condition: &Condition,
        seed: u64,
        replications: u32,
    ) -> SimResult<ConditionRun> {
        let start = Instant::now();
        let outcomes = (0..replications)
            .map(|rep| self.replicate(condition, seed, rep))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|(rep, err)| fatal(index, condition, rep, &err))?;

        Ok(self.finish(index, condition, seed, outcomes, start.elapsed()))
    }

    /// Run `replications` replications on `pool`.
    ///
    /// Outcomes are identical to [`ReplicationRunner::run`]; only wall-clock
    /// time differs. After a fatal failure no further replication starts.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a replication fails fatally.
    pub fn run_on(
        &self,
        pool: &WorkerPool,
        index: usize,
        condition: &Condition,
        seed: u64,
        replications: u32,
    ) -> SimResult<ConditionRun> {
        let start = Instant::now();
        let aborted = AtomicBool::new(false);

        let results = pool.execute(replications as usize, |task| {
            if aborted.load(Ordering::Relaxed) {
                return None;
            }
            let result = self.replicate(condition, seed, task as u32);
            if result.is_err() {
                aborted.store(true, Ordering::Relaxed);
            }
            Some(result)
        });

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_fatal = None;
        for result in results {
            match result {
                Some(Ok(outcome)) => outcomes.push(outcome),
                Some(Err(failure)) => {
                    first_fatal.get_or_insert(failure);
                }
                None => {}
            }
        }
        if let Some((rep, err)) = first_fatal {
            return Err(fatal(index, condition, rep, &err));
        }

        Ok(self.finish(index, condition, seed, outcomes, start.elapsed()))
    }

    /// One replication with retries. `Err` carries the replication index of
    /// a fatal failure.
    fn replicate(
        &self,
        condition: &Condition,
        condition_seed: u64,
        rep: u32,
    ) -> Result<ReplicationOutcome, (u32, ReplicationError)> {
        let replication_seed = derive_seed(condition_seed, u64::from(rep));
        let mut attempt = 0;

        loop {
            let mut rng = SimRng::for_stream(replication_seed, u64::from(attempt));
            let result = self
                .generator
                .generate(condition, &mut rng)
                .and_then(|data| self.fitter.fit(condition, &data));

            match result {
                Ok(fitted) => {
                    tracing::trace!(replication = rep, attempt, "replication fitted");
                    return Ok(ReplicationOutcome {
                        index: rep,
                        attempts: attempt + 1,
                        result: ReplicationResult::Success {
                            stats: fitted.stats,
                            warnings: fitted.warnings,
                        },
                    });
                }
                Err(err) if !err.is_recoverable() => return Err((rep, err)),
                Err(err) if attempt < self.max_retries => {
                    tracing::debug!(replication = rep, attempt, error = %err, "retrying replication");
                    attempt += 1;
                }
                Err(err) => {
                    tracing::debug!(replication = rep, attempt, error = %err, "replication dropped");
                    return Ok(ReplicationOutcome {
                        index: rep,
                        attempts: attempt + 1,
                        result: ReplicationResult::Failed(err),
                    });
                }
            }
        }
    }

    fn finish(
        &self,
        index: usize,
        condition: &Condition,
        seed: u64,
        outcomes: Vec<ReplicationOutcome>,
        elapsed: Duration,
    ) -> ConditionRun {
        let run = ConditionRun {
            index,
            condition: *condition,
            seed,
            outcomes,
            elapsed,
        };

        if run.failed() > 0 || run.warnings() > 0 {
            tracing::warn!(
                condition = %condition,
                completed = run.completed(),
                failed = run.failed(),
                retries = run.retries(),
                warnings = run.warnings(),
                "replications finished with failures or warnings"
            );
        } else {
            tracing::debug!(
                condition = %condition,
                completed = run.completed(),
                "replications finished"
            );
        }
        run
    }
}

fn fatal(index: usize, condition: &Condition, rep: u32, err: &ReplicationError) -> SimError {
    SimError::config(format!(
        "condition #{} {condition}, replication {}: {err}",
        index + 1,
        rep + 1
    ))
}
