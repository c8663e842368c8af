use thiserror::Error;

/// Errors raised while configuring, building, training or persisting a model.
#[derive(Debug, Error)]
pub enum HmmError {
    /// An option value could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A transition row does not have one entry per state.
    #[error("state {state} has {found} transitions, expected {expected}")]
    DimensionMismatch {
        state: usize,
        expected: usize,
        found: usize,
    },

    /// Start/end placement or state types are inconsistent.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("no such state: {0}")]
    UnknownState(usize),

    #[error("corpus contains no sequences")]
    EmptyCorpus,

    /// The L-BFGS minimizer gave up.
    #[error("optimizer error: {0}")]
    Optimizer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    BsonSerialize(#[from] bson::ser::Error),

    #[error(transparent)]
    BsonDeserialize(#[from] bson::de::Error),
}

pub type Result<T> = std::result::Result<T, HmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = HmmError::InvalidConfiguration("unknown unseen mode: foo".into());
        assert_eq!(err.to_string(), "invalid configuration: unknown unseen mode: foo");

        let err = HmmError::DimensionMismatch { state: 3, expected: 5, found: 4 };
        assert!(err.to_string().contains("state 3"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HmmError>();
    }
}
