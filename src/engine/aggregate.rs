//! Aggregation of replication results into one summary row per condition.

use crate::domains::STANDARD_FIT_STATISTICS;
use crate::engine::runner::ConditionRun;
use crate::error::{SimError, SimResult};
use crate::results::ConditionSummary;

/// Element-wise mean of the successful fit vectors of a condition.
///
/// Every fit vector must carry the aggregator's layout; a mismatch means
/// the fitter does not honour its contract and is a configuration error.
#[derive(Debug, Clone)]
pub struct Aggregator {
    layout: Vec<String>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(STANDARD_FIT_STATISTICS.iter().map(|s| (*s).to_string()).collect())
    }
}

impl Aggregator {
    /// Aggregator expecting fit vectors with statistic names `layout`.
    #[must_use]
    pub const fn new(layout: Vec<String>) -> Self {
        Self { layout }
    }

    /// Expected statistic names.
    #[must_use]
    pub fn layout(&self) -> &[String] {
        &self.layout
    }

    /// Reduce a condition run to its summary row.
    ///
    /// Sums run in replication-index order, so the result is bitwise
    /// independent of the order in which outcomes were collected. With no
    /// successful replication every mean is NaN and the row is flagged
    /// `fully_failed`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a fit vector's layout differs from
    /// the expected one.
    pub fn summarize(&self, run: &ConditionRun) -> SimResult<ConditionSummary> {
        let mut successes: Vec<_> = run.successes().collect();
        successes.sort_by_key(|(index, _)| *index);

        let mut sums = vec![0.0; self.layout.len()];
        for (index, stats) in &successes {
            if stats.names() != self.layout.as_slice() {
                return Err(SimError::config(format!(
                    "condition #{} {}, replication {}: fit statistics [{}] do not match expected layout [{}]",
                    run.index + 1,
                    run.condition,
                    index + 1,
                    stats.names().join(", "),
                    self.layout.join(", ")
                )));
            }
            for (sum, value) in sums.iter_mut().zip(stats.values()) {
                *sum += value;
            }
        }

        let fully_failed = successes.is_empty();
        let means = if fully_failed {
            vec![f64::NAN; self.layout.len()]
        } else {
            let n = successes.len() as f64;
            // One NaN bit pattern, the one the state file reads back.
            sums.into_iter()
                .map(|s| if s.is_nan() { f64::NAN } else { s / n })
                .collect()
        };

        Ok(ConditionSummary {
            index: run.index,
            condition: run.condition,
            statistics: self.layout.clone(),
            means,
            replications: run.replications(),
            completed: run.completed(),
            failed: run.failed(),
            retries: run.retries(),
            warnings: run.warnings(),
            failures: run.failures_by_kind(),
            fully_failed,
            seed: run.seed,
            elapsed: run.elapsed,
        })
    }
}
