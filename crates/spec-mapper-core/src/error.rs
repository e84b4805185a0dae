//! Error taxonomy for the mapping core.
//!
//! Transient infrastructure failures ([`MapError::RetrievalUnavailable`],
//! [`MapError::EmbeddingUnavailable`], [`MapError::ValidatorUnavailable`],
//! [`MapError::Timeout`]) are retried by [`RetryPolicy`](crate::retry::RetryPolicy).
//! Everything else surfaces to the caller on the first occurrence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    /// The specification document is malformed or uses an unsupported construct.
    #[error("spec parse error at {path}: {message}")]
    SpecParse { path: String, message: String },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("validator unavailable: {0}")]
    ValidatorUnavailable(String),

    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// A request the remote side rejected as malformed. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The agent gave up on a field because its collaborators kept failing.
    #[error("mapping abandoned for field {field}: {reason}")]
    Abandoned { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MapError {
    pub fn spec_parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpecParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetrievalUnavailable(_)
                | Self::EmbeddingUnavailable(_)
                | Self::ValidatorUnavailable(_)
                | Self::Timeout { .. }
        )
    }
}

pub type Result<T, E = MapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MapError::RetrievalUnavailable("down".into()).is_retryable());
        assert!(MapError::EmbeddingUnavailable("429".into()).is_retryable());
        assert!(MapError::ValidatorUnavailable("503".into()).is_retryable());
        assert!(MapError::Timeout {
            operation: "validate".into()
        }
        .is_retryable());

        assert!(!MapError::CollectionNotFound("hr".into()).is_retryable());
        assert!(!MapError::InvalidRequest("bad body".into()).is_retryable());
        assert!(!MapError::spec_parse("paths./a", "not an object").is_retryable());
    }

    #[test]
    fn test_spec_parse_names_path() {
        let err = MapError::spec_parse("components.schemas.Absence", "expected object");
        assert_eq!(
            err.to_string(),
            "spec parse error at components.schemas.Absence: expected object"
        );
    }
}
