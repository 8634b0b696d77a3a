//! Experimental design: factors, conditions and the condition grid.
//!
//! The grid is the full cross-product of the configured factor levels,
//! ordered lexicographically in factor-declaration order
//! (`sample_size`, then `model_type`, then `data_type`). A condition's row
//! index is its identity for seeding and for resuming.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SimError, SimResult};

/// Structure of the model fitted to each dataset.
///
/// Accepts `true`/`misspecified` as names and, since YAML reads a bare
/// `true` as a boolean, also `true`/`false` as flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "ModelTypeRepr")]
pub enum ModelType {
    /// The fitted model matches the population structure.
    True,
    /// The fitted model omits the population cross-loading.
    Misspecified,
}

impl ModelType {
    /// Column label used in exports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::Misspecified => "misspecified",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelTypeRepr {
    Flag(bool),
    Name(String),
}

impl TryFrom<ModelTypeRepr> for ModelType {
    type Error = String;

    fn try_from(repr: ModelTypeRepr) -> Result<Self, Self::Error> {
        match repr {
            ModelTypeRepr::Flag(true) => Ok(Self::True),
            ModelTypeRepr::Flag(false) => Ok(Self::Misspecified),
            ModelTypeRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Self::True),
                "misspecified" => Ok(Self::Misspecified),
                other => Err(format!(
                    "unknown model type '{other}', expected 'true' or 'misspecified'"
                )),
            },
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distribution of the generated indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Multivariate normal indicators.
    Normal,
    /// Skewed, heavy-tailed indicators.
    NonNormal,
}

impl DataType {
    /// Column label used in exports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::NonNormal => "non_normal",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point of the experimental design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    /// Number of observations per generated dataset.
    pub sample_size: u32,
    /// Fitted model structure.
    pub model_type: ModelType,
    /// Indicator distribution.
    pub data_type: DataType,
}

impl Condition {
    /// Create a condition.
    #[must_use]
    pub const fn new(sample_size: u32, model_type: ModelType, data_type: DataType) -> Self {
        Self {
            sample_size,
            model_type,
            data_type,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(n={}, model={}, data={})",
            self.sample_size, self.model_type, self.data_type
        )
    }
}

/// Ordered levels of each experimental factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactorLevels {
    /// Sample size levels.
    pub sample_size: Vec<u32>,
    /// Model specification levels.
    pub model_type: Vec<ModelType>,
    /// Data distribution levels.
    pub data_type: Vec<DataType>,
}

impl Default for FactorLevels {
    fn default() -> Self {
        Self {
            sample_size: vec![100, 200, 500, 1000],
            model_type: vec![ModelType::True, ModelType::Misspecified],
            data_type: vec![DataType::Normal, DataType::NonNormal],
        }
    }
}

impl FactorLevels {
    /// Check that every factor has at least one level, no level repeats and
    /// every sample size is positive.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending factor.
    pub fn check(&self) -> SimResult<()> {
        check_levels("sample_size", &self.sample_size)?;
        check_levels("model_type", &self.model_type)?;
        check_levels("data_type", &self.data_type)?;

        if self.sample_size.contains(&0) {
            return Err(SimError::config("factor 'sample_size' contains 0"));
        }
        Ok(())
    }
}

fn check_levels<T: PartialEq + fmt::Debug>(factor: &str, levels: &[T]) -> SimResult<()> {
    if levels.is_empty() {
        return Err(SimError::config(format!("factor '{factor}' has no levels")));
    }
    for (i, level) in levels.iter().enumerate() {
        if levels[..i].contains(level) {
            return Err(SimError::config(format!(
                "factor '{factor}' lists level {level:?} more than once"
            )));
        }
    }
    Ok(())
}

/// The ordered cross-product of all factor levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionGrid {
    conditions: Vec<Condition>,
}

impl ConditionGrid {
    /// Build the full cross-product of `levels`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a factor has no levels, repeats a
    /// level, or lists a zero sample size.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cfasim::design::{ConditionGrid, DataType, FactorLevels, ModelType};
    ///
    /// let levels = FactorLevels {
    ///     sample_size: vec![100, 200],
    ///     model_type: vec![ModelType::True, ModelType::Misspecified],
    ///     data_type: vec![DataType::Normal],
    /// };
    /// let grid = ConditionGrid::build(&levels).unwrap();
    /// assert_eq!(grid.len(), 4);
    /// ```
    pub fn build(levels: &FactorLevels) -> SimResult<Self> {
        levels.check()?;

        let capacity = levels.sample_size.len() * levels.model_type.len() * levels.data_type.len();
        let mut conditions = Vec::with_capacity(capacity);

        for &sample_size in &levels.sample_size {
            for &model_type in &levels.model_type {
                for &data_type in &levels.data_type {
                    conditions.push(Condition::new(sample_size, model_type, data_type));
                }
            }
        }

        Ok(Self { conditions })
    }

    /// Number of conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Whether the grid has no conditions. Never true for a built grid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Condition at row `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Condition> {
        self.conditions.get(index)
    }

    /// All conditions in grid order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Iterate `(row index, condition)` pairs in grid order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Condition)> {
        self.conditions.iter().enumerate()
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn subset<T: Copy>(all: &[T], mask: u8) -> Vec<T> {
        all.iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, v)| *v)
            .collect()
    }

    proptest! {
        /// Falsification test: k1 x k2 x k3 unique conditions, stable order.
        #[test]
        fn prop_cross_product_complete(
            sizes in proptest::collection::hash_set(1u32..5000, 1..6),
            model_mask in 1u8..4,
            data_mask in 1u8..4,
        ) {
            let levels = FactorLevels {
                sample_size: sizes.into_iter().collect(),
                model_type: subset(&[ModelType::True, ModelType::Misspecified], model_mask),
                data_type: subset(&[DataType::Normal, DataType::NonNormal], data_mask),
            };
            let grid = ConditionGrid::build(&levels).unwrap();
            let expected = levels.sample_size.len() * levels.model_type.len() * levels.data_type.len();
            prop_assert_eq!(grid.len(), expected);

            let unique: HashSet<Condition> = grid.conditions().iter().copied().collect();
            prop_assert_eq!(unique.len(), expected);

            let again = ConditionGrid::build(&levels).unwrap();
            prop_assert_eq!(grid, again);
        }
    }
}
