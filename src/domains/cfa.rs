//! Surrogate CFA backend for dry runs.
//!
//! Population: two correlated factors, `k` indicators each, with one
//! cross-loading of the first indicator of factor 2 on factor 1. Indicators
//! are standardized (unit variance).
//!
//! - [`PopulationGenerator`] draws `x = Λη + θ^{1/2}ε`. Non-normal data
//!   pass every latent and residual draw through Fleishman's power
//!   transform with skew 2 and excess kurtosis 7.
//! - [`SurrogateFitter`] does not estimate anything. It holds the
//!   hypothesized model fixed at the population values (the misspecified
//!   model drops the cross-loading), measures the GLS discrepancy between
//!   the sample correlation matrix and the implied one, and derives the
//!   usual indices (chi-square, df, CFI, TLI, RMSEA, SRMR) from it.

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{DataGenerator, Dataset, FitVector, FittedModel, ModelFitter};
use crate::design::{Condition, DataType, ModelType};
use crate::engine::rng::SimRng;
use crate::error::ReplicationError;

/// Fleishman coefficients `(b, c, d)` for skew 2, excess kurtosis 7
/// (`a = -c`).
const FLEISHMAN_SKEW2_KURT7: (f64, f64, f64) = (0.761_585, 0.260_022, 0.053_072);

/// Pivot ratio below which a sample covariance is reported as near-singular.
const NEAR_SINGULAR_RATIO: f64 = 1e-8;

/// Population factor model shared by the generator and the fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PopulationModel {
    /// Indicators per factor.
    #[validate(range(min = 2, max = 50))]
    #[serde(default = "default_indicators_per_factor")]
    pub indicators_per_factor: usize,
    /// Primary standardized loading of every indicator.
    #[validate(range(min = 0.05, max = 0.95))]
    #[serde(default = "default_loading")]
    pub loading: f64,
    /// Loading of the first factor-2 indicator on factor 1.
    #[validate(range(min = -0.9, max = 0.9))]
    #[serde(default = "default_cross_loading")]
    pub cross_loading: f64,
    /// Correlation between the two factors.
    #[validate(range(min = -0.95, max = 0.95))]
    #[serde(default = "default_factor_correlation")]
    pub factor_correlation: f64,
}

const fn default_indicators_per_factor() -> usize {
    3
}

const fn default_loading() -> f64 {
    0.7
}

const fn default_cross_loading() -> f64 {
    0.4
}

const fn default_factor_correlation() -> f64 {
    0.3
}

impl Default for PopulationModel {
    fn default() -> Self {
        Self {
            indicators_per_factor: default_indicators_per_factor(),
            loading: default_loading(),
            cross_loading: default_cross_loading(),
            factor_correlation: default_factor_correlation(),
        }
    }
}

impl PopulationModel {
    /// Number of observed indicators.
    #[must_use]
    pub const fn indicators(&self) -> usize {
        2 * self.indicators_per_factor
    }

    /// Index of the cross-loading indicator.
    const fn cross_indicator(&self) -> usize {
        self.indicators_per_factor
    }

    /// Loadings `(on factor 1, on factor 2)` of `indicator`, with or without
    /// the cross-loading.
    fn loadings(&self, indicator: usize, with_cross: bool) -> (f64, f64) {
        if indicator < self.indicators_per_factor {
            (self.loading, 0.0)
        } else if with_cross && indicator == self.cross_indicator() {
            (self.cross_loading, self.loading)
        } else {
            (0.0, self.loading)
        }
    }

    /// Common variance of `indicator`.
    fn communality(&self, indicator: usize) -> f64 {
        let (l1, l2) = self.loadings(indicator, true);
        l1 * l1 + l2 * l2 + 2.0 * l1 * l2 * self.factor_correlation
    }

    /// Whether every indicator keeps a positive residual variance.
    #[must_use]
    pub fn is_admissible(&self) -> bool {
        (0..self.indicators()).all(|i| self.communality(i) < 1.0)
    }

    /// Model-implied correlation matrix (row-major, unit diagonal).
    #[must_use]
    pub fn implied_correlation(&self, model_type: ModelType) -> Vec<f64> {
        let p = self.indicators();
        let with_cross = model_type == ModelType::True;
        let phi = self.factor_correlation;
        let mut implied = vec![0.0; p * p];

        for i in 0..p {
            for j in 0..p {
                implied[i * p + j] = if i == j {
                    1.0
                } else {
                    let (a1, a2) = self.loadings(i, with_cross);
                    let (b1, b2) = self.loadings(j, with_cross);
                    a1 * b1 + a2 * b2 + phi * (a1 * b2 + a2 * b1)
                };
            }
        }
        implied
    }

    /// Free parameters of the hypothesized CFA: loadings, residual
    /// variances and the factor correlation.
    #[must_use]
    pub const fn free_parameters(&self, model_type: ModelType) -> usize {
        let p = self.indicators();
        let cross = match model_type {
            ModelType::True => 1,
            ModelType::Misspecified => 0,
        };
        p + cross + p + 1
    }

    /// Degrees of freedom of the hypothesized CFA.
    #[must_use]
    pub const fn degrees_of_freedom(&self, model_type: ModelType) -> usize {
        let p = self.indicators();
        (p * (p + 1) / 2).saturating_sub(self.free_parameters(model_type))
    }
}

/// Draws datasets from the population model.
#[derive(Debug, Clone, Default)]
pub struct PopulationGenerator {
    model: PopulationModel,
}

impl PopulationGenerator {
    /// Generator for `model`.
    #[must_use]
    pub const fn new(model: PopulationModel) -> Self {
        Self { model }
    }
}

/// Standardized draw: standard normal, or Fleishman-transformed.
fn standard_draw(rng: &mut SimRng, data_type: DataType) -> f64 {
    let z = rng.gen_standard_normal();
    match data_type {
        DataType::Normal => z,
        DataType::NonNormal => {
            let (b, c, d) = FLEISHMAN_SKEW2_KURT7;
            -c + b * z + c * z * z + d * z * z * z
        }
    }
}

impl DataGenerator for PopulationGenerator {
    fn generate(&self, condition: &Condition, rng: &mut SimRng) -> Result<Dataset, ReplicationError> {
        let model = &self.model;
        let p = model.indicators();
        let n = condition.sample_size as usize;
        let phi = model.factor_correlation;

        let residual_sd: Vec<f64> = (0..p)
            .map(|i| {
                let unique = 1.0 - model.communality(i);
                if unique > 0.0 {
                    Ok(unique.sqrt())
                } else {
                    Err(ReplicationError::SingularCovariance(format!(
                        "indicator {i} has non-positive residual variance {unique:.4}"
                    )))
                }
            })
            .collect::<Result<_, _>>()?;

        let mut values = Vec::with_capacity(n * p);
        for _ in 0..n {
            let z1 = standard_draw(rng, condition.data_type);
            let z2 = standard_draw(rng, condition.data_type);
            let eta1 = z1;
            let eta2 = phi * z1 + (1.0 - phi * phi).sqrt() * z2;

            for (i, sd) in residual_sd.iter().enumerate() {
                let (l1, l2) = model.loadings(i, true);
                values.push(l1 * eta1 + l2 * eta2 + sd * standard_draw(rng, condition.data_type));
            }
        }

        Dataset::from_row_major(n, p, values)
    }
}

/// Fixed-parameter surrogate for an ML CFA fit.
#[derive(Debug, Clone, Default)]
pub struct SurrogateFitter {
    model: PopulationModel,
}

impl SurrogateFitter {
    /// Fitter hypothesizing `model`.
    #[must_use]
    pub const fn new(model: PopulationModel) -> Self {
        Self { model }
    }
}

impl ModelFitter for SurrogateFitter {
    fn fit(&self, condition: &Condition, data: &Dataset) -> Result<FittedModel, ReplicationError> {
        let p = self.model.indicators();
        if data.columns() != p {
            return Err(ReplicationError::Fatal(format!(
                "model expects {p} indicators, dataset has {}",
                data.columns()
            )));
        }
        let n = data.rows();
        if n <= p {
            return Err(ReplicationError::SingularCovariance(format!(
                "{n} observations cannot support {p} indicators"
            )));
        }

        let covariance = sample_covariance(data);
        let pivots = cholesky(&covariance, p)
            .map(|factor| (0..p).map(|i| factor[i * p + i]).collect::<Vec<_>>())
            .ok_or_else(|| {
                ReplicationError::SingularCovariance("sample covariance is not positive definite".into())
            })?;

        let mut fitted_warnings = Vec::new();
        let (min_pivot, max_pivot) = pivots
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if (min_pivot / max_pivot).powi(2) < NEAR_SINGULAR_RATIO {
            fitted_warnings.push("sample covariance matrix is near-singular".to_string());
        }

        let correlation = to_correlation(&covariance, p);
        let implied = self.model.implied_correlation(condition.model_type);
        let scale = (n - 1) as f64;

        let chisq = scale * gls_discrepancy(&correlation, &implied, p)?;
        let df = self.model.degrees_of_freedom(condition.model_type) as f64;

        let baseline_df = (p * (p - 1) / 2) as f64;
        let baseline_chisq = scale * off_diagonal_sum_sq(&correlation, p);

        let excess = (chisq - df).max(0.0);
        let baseline_excess = (baseline_chisq - baseline_df).max(0.0);
        let cfi = {
            let denom = excess.max(baseline_excess);
            if denom > 0.0 {
                1.0 - excess / denom
            } else {
                1.0
            }
        };
        let tli = {
            let baseline_ratio = baseline_chisq / baseline_df;
            if baseline_ratio > 1.0 && df > 0.0 {
                (baseline_ratio - chisq / df) / (baseline_ratio - 1.0)
            } else {
                1.0
            }
        };
        let rmsea = if df > 0.0 {
            (excess / (df * scale)).sqrt()
        } else {
            0.0
        };
        let srmr = srmr(&correlation, &implied, p);

        let mut fitted = FittedModel::new(FitVector::standard(cfi, tli, rmsea, srmr, chisq, df));
        fitted.warnings = fitted_warnings;
        Ok(fitted)
    }
}

/// Unbiased sample covariance (row-major `p x p`).
fn sample_covariance(data: &Dataset) -> Vec<f64> {
    let p = data.columns();
    let n = data.rows() as f64;

    let mut means = vec![0.0; p];
    for row in data.iter_rows() {
        for (m, x) in means.iter_mut().zip(row) {
            *m += x;
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut cov = vec![0.0; p * p];
    for row in data.iter_rows() {
        for i in 0..p {
            let di = row[i] - means[i];
            for j in 0..=i {
                cov[i * p + j] += di * (row[j] - means[j]);
            }
        }
    }
    for i in 0..p {
        for j in 0..=i {
            let v = cov[i * p + j] / (n - 1.0);
            cov[i * p + j] = v;
            cov[j * p + i] = v;
        }
    }
    cov
}

fn to_correlation(cov: &[f64], p: usize) -> Vec<f64> {
    let sd: Vec<f64> = (0..p).map(|i| cov[i * p + i].sqrt()).collect();
    let mut corr = vec![0.0; p * p];
    for i in 0..p {
        for j in 0..p {
            corr[i * p + j] = if i == j {
                1.0
            } else {
                cov[i * p + j] / (sd[i] * sd[j])
            };
        }
    }
    corr
}

/// Lower Cholesky factor of a symmetric matrix, `None` unless positive
/// definite.
fn cholesky(a: &[f64], p: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; p * p];
    for i in 0..p {
        for j in 0..=i {
            let mut sum = a[i * p + j];
            for k in 0..j {
                sum -= l[i * p + k] * l[j * p + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i * p + i] = sum.sqrt();
            } else {
                l[i * p + j] = sum / l[j * p + j];
            }
        }
    }
    Some(l)
}

/// Solve `A x = b` given the lower Cholesky factor of `A`.
fn cholesky_solve(l: &[f64], p: usize, b: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; p];
    for i in 0..p {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * p + k] * y[k];
        }
        y[i] = sum / l[i * p + i];
    }
    let mut x = vec![0.0; p];
    for i in (0..p).rev() {
        let mut sum = y[i];
        for k in (i + 1)..p {
            sum -= l[k * p + i] * x[k];
        }
        x[i] = sum / l[i * p + i];
    }
    x
}

/// GLS discrepancy `½ tr((P⁻¹(R − P))²)`.
fn gls_discrepancy(sample: &[f64], implied: &[f64], p: usize) -> Result<f64, ReplicationError> {
    let factor = cholesky(implied, p).ok_or_else(|| {
        ReplicationError::Fatal("implied correlation matrix is not positive definite".into())
    })?;

    // Columns of M = P⁻¹ D.
    let mut m = vec![0.0; p * p];
    for col in 0..p {
        let d_col: Vec<f64> = (0..p).map(|row| sample[row * p + col] - implied[row * p + col]).collect();
        for (row, v) in cholesky_solve(&factor, p, &d_col).into_iter().enumerate() {
            m[row * p + col] = v;
        }
    }

    let mut trace = 0.0;
    for i in 0..p {
        for j in 0..p {
            trace += m[i * p + j] * m[j * p + i];
        }
    }
    Ok(0.5 * trace)
}

fn off_diagonal_sum_sq(corr: &[f64], p: usize) -> f64 {
    let mut sum = 0.0;
    for i in 0..p {
        for j in 0..i {
            sum += corr[i * p + j] * corr[i * p + j];
        }
    }
    sum
}

/// Standardized root mean square residual over the lower triangle.
fn srmr(sample: &[f64], implied: &[f64], p: usize) -> f64 {
    let mut sum = 0.0;
    for i in 0..p {
        for j in 0..=i {
            let r = sample[i * p + j] - implied[i * p + j];
            sum += r * r;
        }
    }
    (sum / (p * (p + 1) / 2) as f64).sqrt()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn condition(n: u32, model: ModelType, data: DataType) -> Condition {
        Condition::new(n, model, data)
    }

    fn mean_stat(model: ModelType, n: u32, stat: &str, reps: u64) -> f64 {
        let generator = PopulationGenerator::default();
        let fitter = SurrogateFitter::default();
        let c = condition(n, model, DataType::Normal);
        let total: f64 = (0..reps)
            .map(|r| {
                let mut rng = SimRng::for_stream(99, r);
                let data = generator.generate(&c, &mut rng).unwrap();
                fitter.fit(&c, &data).unwrap().stats.get(stat).unwrap()
            })
            .sum();
        total / reps as f64
    }

    #[test]
    fn test_population_degrees_of_freedom() {
        let model = PopulationModel::default();
        assert_eq!(model.indicators(), 6);
        assert_eq!(model.degrees_of_freedom(ModelType::True), 7);
        assert_eq!(model.degrees_of_freedom(ModelType::Misspecified), 8);
    }

    #[test]
    fn test_implied_correlation_symmetric_unit_diagonal() {
        let model = PopulationModel::default();
        let p = model.indicators();
        for model_type in [ModelType::True, ModelType::Misspecified] {
            let implied = model.implied_correlation(model_type);
            for i in 0..p {
                assert!((implied[i * p + i] - 1.0).abs() < f64::EPSILON);
                for j in 0..p {
                    assert!((implied[i * p + j] - implied[j * p + i]).abs() < 1e-12);
                }
            }
        }
        let true_model = model.implied_correlation(ModelType::True);
        let misspecified = model.implied_correlation(ModelType::Misspecified);
        // x1 with x4 differs only through the cross-loading.
        assert!(true_model[3] > misspecified[3]);
    }

    #[test]
    fn test_generator_shape_and_determinism() {
        let generator = PopulationGenerator::default();
        let c = condition(50, ModelType::True, DataType::NonNormal);
        let a = generator.generate(&c, &mut SimRng::new(5)).unwrap();
        let b = generator.generate(&c, &mut SimRng::new(5)).unwrap();
        assert_eq!(a.rows(), 50);
        assert_eq!(a.columns(), 6);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fleishman_moments() {
        let mut rng = SimRng::new(11);
        let n = 200_000;
        let draws: Vec<f64> = (0..n).map(|_| standard_draw(&mut rng, DataType::NonNormal)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let skew = draws.iter().map(|x| (x - mean).powi(3)).sum::<f64>() / n as f64 / var.powf(1.5);
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        assert!((skew - 2.0).abs() < 0.3, "skew {skew}");
    }

    #[test]
    fn test_too_few_observations_is_recoverable() {
        let generator = PopulationGenerator::default();
        let fitter = SurrogateFitter::default();
        let c = condition(4, ModelType::True, DataType::Normal);
        let data = generator.generate(&c, &mut SimRng::new(1)).unwrap();
        let err = fitter.fit(&c, &data).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.kind(), "singular_covariance");
    }

    #[test]
    fn test_constant_indicator_is_singular() {
        let fitter = SurrogateFitter::default();
        let c = condition(20, ModelType::True, DataType::Normal);
        let values: Vec<f64> = (0..20 * 6)
            .map(|k| if k % 6 == 0 { 1.0 } else { (k * 7 % 13) as f64 })
            .collect();
        let data = Dataset::from_row_major(20, 6, values).unwrap();
        let err = fitter.fit(&c, &data).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_wrong_indicator_count_is_fatal() {
        let fitter = SurrogateFitter::default();
        let c = condition(20, ModelType::True, DataType::Normal);
        let data = Dataset::from_row_major(20, 2, vec![0.5; 40]).unwrap();
        assert!(!fitter.fit(&c, &data).unwrap_err().is_recoverable());
    }

    #[test]
    fn test_fit_indices_in_range() {
        let generator = PopulationGenerator::default();
        let fitter = SurrogateFitter::default();
        let c = condition(300, ModelType::True, DataType::Normal);
        let data = generator.generate(&c, &mut SimRng::new(3)).unwrap();
        let fit = fitter.fit(&c, &data).unwrap().stats;

        assert!((0.0..=1.0).contains(&fit.get("cfi").unwrap()));
        assert!(fit.get("rmsea").unwrap() >= 0.0);
        assert!(fit.get("srmr").unwrap() >= 0.0);
        assert!(fit.get("chisq").unwrap() >= 0.0);
        assert!((fit.get("df").unwrap() - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_misspecification_raises_srmr() {
        let true_srmr = mean_stat(ModelType::True, 1000, "srmr", 20);
        let miss_srmr = mean_stat(ModelType::Misspecified, 1000, "srmr", 20);
        assert!(miss_srmr > true_srmr, "{miss_srmr} <= {true_srmr}");
    }

    #[test]
    fn test_sample_size_shrinks_srmr() {
        let small = mean_stat(ModelType::True, 100, "srmr", 20);
        let large = mean_stat(ModelType::True, 2000, "srmr", 20);
        assert!(large < small, "{large} >= {small}");
    }

    #[test]
    fn test_population_yaml_defaults() {
        let model: PopulationModel = serde_yaml::from_str("loading: 0.6\n").unwrap();
        assert!((model.loading - 0.6).abs() < f64::EPSILON);
        assert_eq!(model.indicators_per_factor, 3);
        assert!(model.validate().is_ok());

        let bad: PopulationModel = serde_yaml::from_str("loading: 1.5\n").unwrap();
        assert!(bad.validate().is_err());

        let heywood: PopulationModel =
            serde_yaml::from_str("loading: 0.9\ncross_loading: 0.9\nfactor_correlation: 0.9\n").unwrap();
        assert!(heywood.validate().is_ok());
        assert!(!heywood.is_admissible());
        assert!(PopulationModel::default().is_admissible());
    }
}
