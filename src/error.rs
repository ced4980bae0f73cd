use thiserror::Error;

/// Failures raised while constructing or running a backend executor.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("invalid executor configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Backend(String),

    #[error("{0}")]
    Timeout(String),

    #[error("unsupported backend type: {0}")]
    UnsupportedBackend(String),
}

impl ExecutorError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Backend and timeout failures consume a retry; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}

/// Errors surfaced by the orchestration control plane client.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("resource {0} not found")]
    NotFound(String),

    #[error("resource {0} already exists")]
    AlreadyExists(String),

    #[error("Kubernetes API error (status: {status}): {message}")]
    Api { status: u16, message: String },

    #[error("control plane transport error: {0}")]
    Transport(String),
}

impl From<ControlPlaneError> for ExecutorError {
    fn from(e: ControlPlaneError) -> Self {
        ExecutorError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutorError::backend("boom").is_retryable());
        assert!(ExecutorError::timeout("timed out").is_retryable());
        assert!(!ExecutorError::Config("bad".into()).is_retryable());
        assert!(!ExecutorError::UnsupportedBackend("x".into()).is_retryable());
    }

    #[test]
    fn test_control_plane_error_maps_to_backend() {
        let err: ExecutorError = ControlPlaneError::Api {
            status: 500,
            message: "internal".into(),
        }
        .into();
        assert!(matches!(err, ExecutorError::Backend(_)));
        assert!(err.to_string().contains("status: 500"));
    }
}
