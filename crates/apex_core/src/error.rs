//! Core error types for the mediation engine.
//!
//! Only construction and configuration can fail. Per-source faults during a
//! dispatch are outcomes, not errors.

/// Core result type
pub type CoreResult<T> = Result<T, MediationError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediationError {
    /// Source id is blank
    #[error("Source id must not be empty")]
    EmptySourceId,

    /// Weight is zero, negative or not finite
    #[error("Invalid weight for {id}: {weight}")]
    InvalidWeight {
        /// Offending source
        id: String,
        /// Rejected weight
        weight: f64,
    },

    /// Priority is negative or out of range
    #[error("Invalid priority for {id}: {priority}")]
    InvalidPriority {
        /// Offending source
        id: String,
        /// Rejected priority
        priority: i64,
    },

    /// Timeout is zero
    #[error("Invalid timeout for {id}: must be greater than zero")]
    InvalidTimeout {
        /// Offending source
        id: String,
    },

    /// Bid floor is negative or not finite
    #[error("Invalid bid floor for {id}: {min_bid}")]
    InvalidBidFloor {
        /// Offending source
        id: String,
        /// Rejected floor
        min_bid: f64,
    },

    /// The same id appears twice in one source list
    #[error("Duplicate source id: {id}")]
    DuplicateSource {
        /// Repeated id
        id: String,
    },

    /// Configuration could not be parsed
    #[error("Config error: {message}")]
    Config {
        /// Parser message
        message: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Field name
        field: String,
        /// Why it was rejected
        reason: String,
    },
}

impl From<serde_json::Error> for MediationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MediationError::EmptySourceId;
        assert_eq!(format!("{}", err), "Source id must not be empty");

        let err = MediationError::DuplicateSource {
            id: "admob".to_string(),
        };
        assert_eq!(format!("{}", err), "Duplicate source id: admob");
    }

    #[test]
    fn test_invalid_weight_display() {
        let err = MediationError::InvalidWeight {
            id: "unity".to_string(),
            weight: -1.0,
        };
        let s = format!("{}", err);
        assert!(s.contains("unity"));
        assert!(s.contains("-1"));
    }

    #[test]
    fn test_from_json_error() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: MediationError = parse.unwrap_err().into();
        assert!(matches!(err, MediationError::Config { .. }));
    }

    #[test]
    fn test_error_equality() {
        let err1 = MediationError::EmptySourceId;
        let err2 = MediationError::EmptySourceId;
        assert_eq!(err1, err2);

        let err3 = MediationError::InvalidTimeout { id: "a".to_string() };
        assert_ne!(err1, err3);
    }
}
