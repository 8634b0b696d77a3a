//! Statistical collaborators of the study.
//!
//! The engine only knows two contracts:
//! - [`DataGenerator`]: condition + seeded RNG → one synthetic dataset.
//! - [`ModelFitter`]: condition + dataset → a fixed-layout [`FitVector`]
//!   (plus estimation warnings), or a [`ReplicationError`].
//!
//! Both are pure given their inputs, so the engine can run them on any
//! worker. [`cfa`] provides a surrogate implementation of both for dry runs.

pub mod cfa;

use serde::{Deserialize, Serialize};

use crate::design::Condition;
use crate::engine::rng::SimRng;
use crate::error::ReplicationError;

/// Names of the standard fit statistics, in layout order.
pub const STANDARD_FIT_STATISTICS: [&str; 6] = ["cfi", "tli", "rmsea", "srmr", "chisq", "df"];

/// One synthetic dataset, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    rows: usize,
    columns: usize,
    values: Vec<f64>,
}

impl Dataset {
    /// Wrap row-major `values` of shape `rows x columns`.
    ///
    /// # Errors
    ///
    /// Returns a fatal replication error when the length does not match the
    /// shape.
    pub fn from_row_major(
        rows: usize,
        columns: usize,
        values: Vec<f64>,
    ) -> Result<Self, ReplicationError> {
        if values.len() != rows * columns {
            return Err(ReplicationError::Fatal(format!(
                "dataset of shape {rows}x{columns} needs {} values, got {}",
                rows * columns,
                values.len()
            )));
        }
        Ok(Self {
            rows,
            columns,
            values,
        })
    }

    /// Number of observations.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of observed indicators.
    #[must_use]
    pub const fn columns(&self) -> usize {
        self.columns
    }

    /// Observation `row`.
    #[must_use]
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.columns..(row + 1) * self.columns]
    }

    /// Iterate observations.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.columns.max(1))
    }
}

/// Fit statistics of one fitted model, with their field layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitVector {
    names: Vec<String>,
    values: Vec<f64>,
}

impl FitVector {
    /// Build a vector from parallel `names` and `values`.
    ///
    /// # Errors
    ///
    /// Returns a fatal replication error when the lengths differ.
    pub fn new(names: Vec<String>, values: Vec<f64>) -> Result<Self, ReplicationError> {
        if names.len() != values.len() {
            return Err(ReplicationError::Fatal(format!(
                "fit vector has {} names but {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(Self { names, values })
    }

    /// The standard `cfi, tli, rmsea, srmr, chisq, df` layout.
    #[must_use]
    pub fn standard(cfi: f64, tli: f64, rmsea: f64, srmr: f64, chisq: f64, df: f64) -> Self {
        Self {
            names: STANDARD_FIT_STATISTICS.iter().map(|s| (*s).to_string()).collect(),
            values: vec![cfi, tli, rmsea, srmr, chisq, df],
        }
    }

    /// Statistic names in layout order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Statistic values in layout order.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of the statistic called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    /// Number of statistics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the vector holds no statistics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Output of a successful fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    /// Fit statistics.
    pub stats: FitVector,
    /// Non-fatal estimation warnings (e.g. near-singular covariance).
    pub warnings: Vec<String>,
}

impl FittedModel {
    /// A fit without warnings.
    #[must_use]
    pub const fn new(stats: FitVector) -> Self {
        Self {
            stats,
            warnings: Vec::new(),
        }
    }

    /// Attach a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Draws one dataset for a condition.
///
/// Implementations must be deterministic for a fixed RNG state and must
/// report "no valid covariance structure" as a recoverable error, keeping
/// [`ReplicationError::Fatal`] for programming errors.
pub trait DataGenerator: Sync {
    /// Generate one dataset.
    ///
    /// # Errors
    ///
    /// Recoverable errors are retried with a fresh draw; fatal ones abort.
    fn generate(&self, condition: &Condition, rng: &mut SimRng) -> Result<Dataset, ReplicationError>;
}

/// Fits the condition's model to a dataset.
///
/// Non-convergence must be reported as a recoverable error, not a panic.
pub trait ModelFitter: Sync {
    /// Fit one dataset.
    ///
    /// # Errors
    ///
    /// Recoverable errors are retried with a fresh draw; fatal ones abort.
    fn fit(&self, condition: &Condition, data: &Dataset) -> Result<FittedModel, ReplicationError>;
}

impl<F> DataGenerator for F
where
    F: Fn(&Condition, &mut SimRng) -> Result<Dataset, ReplicationError> + Sync,
{
    fn generate(&self, condition: &Condition, rng: &mut SimRng) -> Result<Dataset, ReplicationError> {
        self(condition, rng)
    }
}

impl<F> ModelFitter for F
where
    F: Fn(&Condition, &Dataset) -> Result<FittedModel, ReplicationError> + Sync,
{
    fn fit(&self, condition: &Condition, data: &Dataset) -> Result<FittedModel, ReplicationError> {
        self(condition, data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_shape() {
        let data = Dataset::from_row_major(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(data.rows(), 2);
        assert_eq!(data.columns(), 3);
        assert_eq!(data.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(data.iter_rows().count(), 2);
    }

    #[test]
    fn test_dataset_shape_mismatch_is_fatal() {
        let err = Dataset::from_row_major(2, 3, vec![1.0; 5]).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_fit_vector_standard_layout() {
        let fit = FitVector::standard(0.99, 0.98, 0.03, 0.04, 10.5, 8.0);
        assert_eq!(fit.len(), 6);
        assert_eq!(fit.names()[2], "rmsea");
        assert_eq!(fit.get("chisq"), Some(10.5));
        assert_eq!(fit.get("aic"), None);
    }

    #[test]
    fn test_fit_vector_length_mismatch() {
        let err = FitVector::new(vec!["cfi".into()], vec![1.0, 2.0]).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_closure_collaborators() {
        let generator = |c: &Condition, _rng: &mut SimRng| {
            Dataset::from_row_major(c.sample_size as usize, 1, vec![0.0; c.sample_size as usize])
        };
        let fitter = |_c: &Condition, d: &Dataset| -> Result<FittedModel, ReplicationError> {
            Ok(FittedModel::new(FitVector::standard(1.0, 1.0, 0.0, 0.0, d.rows() as f64, 0.0)))
        };

        let condition = Condition::new(
            10,
            crate::design::ModelType::True,
            crate::design::DataType::Normal,
        );
        let mut rng = SimRng::new(1);
        let data = generator.generate(&condition, &mut rng).unwrap();
        let fitted = fitter.fit(&condition, &data).unwrap();
        assert_eq!(fitted.stats.get("chisq"), Some(10.0));
        assert!(fitted.warnings.is_empty());
    }
}
