//! Error types for cfasim.
//!
//! Two layers of failure exist in a study:
//! - [`SimError`]: run-level errors that reach the caller (configuration,
//!   resume state, I/O, cancellation).
//! - [`ReplicationError`]: failures scoped to one replication. Recoverable
//!   ones are retried and counted by the replication runner and never
//!   escape it; fatal ones abort the run as a configuration error.

use thiserror::Error;

/// Result type alias for cfasim operations.
pub type SimResult<T> = Result<T, SimError>;

/// Unified error type for run-level failures.
#[derive(Debug, Error)]
pub enum SimError {
    // ===== Configuration Errors =====
    /// Invalid study configuration (empty factor levels, mismatched fit
    /// layouts, fatal collaborator errors).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    // ===== Resume Errors =====
    /// Persisted partial state is unreadable or inconsistent with the study.
    #[error("Resume state error: {message}")]
    ResumeState {
        /// Description of the inconsistency.
        message: String,
    },

    // ===== Run Control =====
    /// The run was cancelled by the caller.
    #[error("Run cancelled after {completed} of {total} conditions")]
    Cancelled {
        /// Conditions completed and persisted before the stop.
        completed: usize,
        /// Conditions in the grid.
        total: usize,
    },

    // ===== I/O Errors =====
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SimError {
    /// Create a configuration error with a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a resume state error with a message.
    #[must_use]
    pub fn resume_state(message: impl Into<String>) -> Self {
        Self::ResumeState {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Check if this error came from the study configuration.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::YamlParse(_) | Self::Validation(_)
        )
    }
}

/// Failure of a single (generate, fit) replication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// The estimator did not converge.
    #[error("model did not converge: {0}")]
    NonConvergence(String),

    /// The data or model produced no valid covariance structure.
    #[error("singular covariance matrix: {0}")]
    SingularCovariance(String),

    /// Any other failure that a fresh random draw may avoid.
    #[error("recoverable failure: {0}")]
    Recoverable(String),

    /// A programming or configuration error; aborts the run.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl ReplicationError {
    /// Whether the runner may retry or drop the replication and continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Short label used in failure counts and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NonConvergence(_) => "non_convergence",
            Self::SingularCovariance(_) => "singular_covariance",
            Self::Recoverable(_) => "recoverable",
            Self::Fatal(_) => "fatal",
        }
    }
}
