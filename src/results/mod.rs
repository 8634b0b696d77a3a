//! Results table: one aggregated row per condition, in grid order.
//!
//! Rows are immutable once aggregated. The table exports to CSV (undefined
//! statistics written as `NA`, infinities as `Inf`/`-Inf`) and JSON, and
//! renders a failure report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::design::Condition;
use crate::error::SimResult;

/// Aggregated fit statistics and provenance of one condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSummary {
    /// Row index of the condition in the grid.
    pub index: usize,
    /// The condition.
    pub condition: Condition,
    /// Statistic names, in layout order.
    pub statistics: Vec<String>,
    /// Element-wise means over successful replications; NaN when the
    /// condition fully failed.
    #[serde(with = "nan_as_null")]
    pub means: Vec<f64>,
    /// Replications requested.
    pub replications: u32,
    /// Replications that produced a fit.
    pub completed: u32,
    /// Replications permanently failed after retries.
    pub failed: u32,
    /// Extra attempts spent on retries.
    pub retries: u32,
    /// Estimation warnings over successful replications.
    pub warnings: u32,
    /// Permanent failures by kind.
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
    /// No replication succeeded.
    pub fully_failed: bool,
    /// Seed the condition's replications were derived from.
    pub seed: u64,
    /// Wall-clock time spent on the condition.
    pub elapsed: Duration,
}

impl ConditionSummary {
    /// Mean of the statistic called `name`.
    #[must_use]
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.statistics
            .iter()
            .position(|s| s == name)
            .and_then(|i| self.means.get(i).copied())
    }
}

// Bitwise comparison of the means so fully failed (NaN) rows compare equal
// to their replayed copies.
impl PartialEq for ConditionSummary {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.condition == other.condition
            && self.statistics == other.statistics
            && self.means.len() == other.means.len()
            && self
                .means
                .iter()
                .zip(&other.means)
                .all(|(a, b)| a.to_bits() == b.to_bits())
            && self.replications == other.replications
            && self.completed == other.completed
            && self.failed == other.failed
            && self.retries == other.retries
            && self.warnings == other.warnings
            && self.failures == other.failures
            && self.fully_failed == other.fully_failed
            && self.seed == other.seed
            && self.elapsed == other.elapsed
    }
}

/// Store NaN as JSON `null` and infinities as the strings `"inf"`/`"-inf"`,
/// so every mean reads back with the same bits.
mod nan_as_null {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Number(f64),
        Label(String),
    }

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|&v| {
                if v.is_nan() {
                    None
                } else if v.is_infinite() {
                    let label = if v.is_sign_positive() { "inf" } else { "-inf" };
                    Some(Stored::Label(label.into()))
                } else {
                    Some(Stored::Number(v))
                }
            })
            .collect::<Vec<Option<Stored>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Option<Stored>>::deserialize(deserializer)?
            .into_iter()
            .map(|v| match v {
                None => Ok(f64::NAN),
                Some(Stored::Number(v)) => Ok(v),
                Some(Stored::Label(label)) => match label.as_str() {
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(D::Error::custom(format!("invalid statistic value '{other}'"))),
                },
            })
            .collect()
    }
}

/// Ordered summaries, one per condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsTable {
    rows: Vec<ConditionSummary>,
}

impl ResultsTable {
    /// Build a table from rows already in grid order.
    #[must_use]
    pub const fn new(rows: Vec<ConditionSummary>) -> Self {
        Self { rows }
    }

    /// Rows in grid order.
    #[must_use]
    pub fn rows(&self) -> &[ConditionSummary] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose every replication failed.
    pub fn fully_failed(&self) -> impl Iterator<Item = &ConditionSummary> {
        self.rows.iter().filter(|r| r.fully_failed)
    }

    /// Write the table as CSV.
    ///
    /// # Errors
    ///
    /// Returns error if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> SimResult<()> {
        let mut csv = csv::Writer::from_writer(writer);

        let statistics = self.rows.first().map(|r| r.statistics.clone()).unwrap_or_default();
        let mut header = vec!["sample_size".to_string(), "model_type".into(), "data_type".into()];
        header.extend(statistics.iter().cloned());
        header.extend(
            [
                "replications",
                "completed",
                "failed",
                "retries",
                "warnings",
                "fully_failed",
                "seed",
                "elapsed_secs",
            ]
            .iter()
            .map(|s| (*s).to_string()),
        );
        csv.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.condition.sample_size.to_string(),
                row.condition.model_type.to_string(),
                row.condition.data_type.to_string(),
            ];
            record.extend(row.means.iter().map(|&m| {
                if m.is_nan() {
                    "NA".to_string()
                } else if m.is_infinite() {
                    if m.is_sign_positive() { "Inf" } else { "-Inf" }.to_string()
                } else {
                    m.to_string()
                }
            }));
            record.extend([
                row.replications.to_string(),
                row.completed.to_string(),
                row.failed.to_string(),
                row.retries.to_string(),
                row.warnings.to_string(),
                row.fully_failed.to_string(),
                row.seed.to_string(),
                format!("{:.6}", row.elapsed.as_secs_f64()),
            ]);
            csv.write_record(&record)?;
        }

        csv.flush()?;
        Ok(())
    }

    /// Write the table as CSV to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.write_csv(std::fs::File::create(path)?)
    }

    /// Write the table as pretty JSON to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Replication failures and retries per condition.
    #[must_use]
    pub fn failure_report(&self) -> FailureReport<'_> {
        FailureReport { table: self }
    }
}

/// Plain-text report of failed and retried replications.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport<'a> {
    table: &'a ResultsTable,
}

impl FailureReport<'_> {
    /// Whether any replication failed or was retried.
    #[must_use]
    pub fn has_issues(&self) -> bool {
        self.table.rows.iter().any(|r| r.failed > 0 || r.retries > 0)
    }
}

impl fmt::Display for FailureReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = &self.table.rows;
        let failed: u32 = rows.iter().map(|r| r.failed).sum();
        let retries: u32 = rows.iter().map(|r| r.retries).sum();
        let warnings: u32 = rows.iter().map(|r| r.warnings).sum();

        writeln!(f, "Replication failures: {failed} failed, {retries} retries, {warnings} warnings")?;

        for row in rows.iter().filter(|r| r.failed > 0 || r.retries > 0) {
            write!(
                f,
                "  #{:<3} {}: {} of {} failed, {} retries",
                row.index + 1,
                row.condition,
                row.failed,
                row.replications,
                row.retries
            )?;
            if !row.failures.is_empty() {
                let kinds: Vec<String> = row.failures.iter().map(|(k, n)| format!("{k}={n}")).collect();
                write!(f, " [{}]", kinds.join(", "))?;
            }
            writeln!(f)?;
        }

        let fully_failed: Vec<&ConditionSummary> = self.table.fully_failed().collect();
        if fully_failed.is_empty() {
            writeln!(f, "Fully failed conditions: none")
        } else {
            writeln!(f, "Fully failed conditions: {}", fully_failed.len())?;
            for row in fully_failed {
                writeln!(f, "  #{:<3} {}", row.index + 1, row.condition)?;
            }
            Ok(())
        }
    }
}
