//! Error types for blobstream

use thiserror::Error;

/// Result type alias for blobstream operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for blobstream
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure talking to the remote store. Transient 5xx
    /// retries happen below this layer, in the HTTP client.
    #[error("Network error: {0}")]
    Network(String),

    /// The object vanished between discovery and (re-)fetch. Fatal for the
    /// current object, never retried at this layer.
    #[error("Object unavailable: {bucket}/{key}")]
    ObjectUnavailable { bucket: String, key: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl IngestError {
    /// True when the error means the object itself is gone (404/410 on
    /// re-fetch). Callers delete the checkpoint and skip the object.
    pub fn is_object_unavailable(&self) -> bool {
        matches!(self, IngestError::ObjectUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_unavailable_discriminator() {
        let err = IngestError::ObjectUnavailable {
            bucket: "logs".to_string(),
            key: "2024/01/app.gz".to_string(),
        };
        assert!(err.is_object_unavailable());
        assert_eq!(err.to_string(), "Object unavailable: logs/2024/01/app.gz");

        let other = IngestError::Network("connection reset".to_string());
        assert!(!other.is_object_unavailable());
    }
}
