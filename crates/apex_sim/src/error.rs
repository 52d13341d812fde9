//! Simulation errors.

use apex_core::MediationError;
use thiserror::Error;

/// Result alias for simulation setup
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised while building or replaying a simulation
#[derive(Debug, Error)]
pub enum SimError {
    /// Outcome model out of range
    #[error("invalid outcome model: {0}")]
    InvalidModel(String),

    /// Source or dispatcher rejected its configuration
    #[error(transparent)]
    Mediation(#[from] MediationError),

    /// Nothing to dispatch to
    #[error("simulation has no sources")]
    NoSources,

    /// Record could not be (de)serialized
    #[error("record serialization failed: {0}")]
    Record(#[from] serde_json::Error),
}
