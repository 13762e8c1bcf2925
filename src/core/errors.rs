use thiserror::Error;

/// Unified error type for the wavefront orchestration core.
///
/// Structural errors (`Validation`, `CycleDetected`, `UnknownDependency`) are
/// reported synchronously at submission; coordination errors (`EpochConflict`,
/// `LeaseExpired`, `LeaseHeld`) are fatal to the current execution attempt and
/// are never retried by the core itself.
#[derive(Debug, Error)]
pub enum WavefrontError {
    /// Malformed step or action reference
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The step set contains a dependency cycle
    #[error("Cycle detected among steps: {steps:?}")]
    CycleDetected { steps: Vec<String> },

    /// A `depends_on` entry does not resolve within the submission
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// A live lease already exists for the workflow
    #[error("Workflow '{workflow_id}' already has a live lease '{lease_id}'")]
    LeaseHeld {
        workflow_id: String,
        lease_id: String,
    },

    /// The action's epoch (or lease id) does not match the current lease
    #[error("Epoch conflict on workflow '{workflow_id}': lease epoch {current}, action carried {carried}")]
    EpochConflict {
        workflow_id: String,
        current: u64,
        carried: u64,
    },

    /// The lease has expired or was released
    #[error("Lease expired for workflow '{workflow_id}'")]
    LeaseExpired { workflow_id: String },

    /// A bounded operation exceeded its deadline
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// An action ran out of retry attempts
    #[error("Retries exhausted for action '{action_id}' after {attempts} attempts")]
    RetryExhausted {
        action_id: String,
        attempts: u32,
        last_error: Option<String>,
    },

    /// An external step executor reported a failure
    #[error("Executor failure on target '{target}': {message}")]
    ExecutorFailure { target: String, message: String },

    /// No executor instance is registered for the capability tag
    #[error("No executor registered for target '{target}'")]
    ExecutorNotRegistered { target: String },

    /// Unknown workflow id
    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    /// Snapshot store failure
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization failure
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Channel send/recv failure between coordinator and workers
    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    /// The workflow was cancelled before completion
    #[error("Workflow cancelled: {workflow_id}")]
    Cancelled { workflow_id: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WavefrontError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error scoped to a field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unknown-dependency error
    pub fn unknown_dependency<S: Into<String>, D: Into<String>>(step: S, dependency: D) -> Self {
        Self::UnknownDependency {
            step: step.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an executor-failure error
    pub fn executor<S: Into<String>, M: Into<String>>(target: S, message: M) -> Self {
        Self::ExecutorFailure {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the coordinator may retry the failed operation.
    ///
    /// Coordination errors are deliberately non-retryable: a conflict or an
    /// expired lease means ownership was lost and the caller must resubmit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ExecutorFailure { .. } => true,
            Self::Storage { .. } | Self::Channel { .. } => true,
            Self::Validation { .. }
            | Self::CycleDetected { .. }
            | Self::UnknownDependency { .. }
            | Self::LeaseHeld { .. }
            | Self::EpochConflict { .. }
            | Self::LeaseExpired { .. }
            | Self::RetryExhausted { .. }
            | Self::ExecutorNotRegistered { .. }
            | Self::WorkflowNotFound { .. }
            | Self::Cancelled { .. } => false,
            Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Error category for logging and per-step failure reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::LeaseHeld { .. } => "lease_held",
            Self::EpochConflict { .. } => "epoch_conflict",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::Timeout { .. } => "timeout",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::ExecutorFailure { .. } => "executor_failure",
            Self::ExecutorNotRegistered { .. } => "executor_not_registered",
            Self::WorkflowNotFound { .. } => "workflow_not_found",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Channel { .. } => "channel",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WavefrontError>;

impl From<serde_json::Error> for WavefrontError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "json".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<std::io::Error> for WavefrontError {
    fn from(err: std::io::Error) -> Self {
        Self::storage("io_operation", err)
    }
}

impl From<sled::Error> for WavefrontError {
    fn from(err: sled::Error) -> Self {
        Self::storage("sled_operation", err)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WavefrontError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::channel("mpsc", err.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for WavefrontError {
    fn from(err: tokio::sync::watch::error::SendError<T>) -> Self {
        Self::channel("watch", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = WavefrontError::CycleDetected {
            steps: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.category(), "cycle_detected");

        let err = WavefrontError::unknown_dependency("b", "ghost");
        assert_eq!(err.category(), "unknown_dependency");
    }

    #[test]
    fn test_coordination_errors_not_retryable() {
        let conflict = WavefrontError::EpochConflict {
            workflow_id: "wf".into(),
            current: 4,
            carried: 3,
        };
        assert!(!conflict.is_retryable());

        let expired = WavefrontError::LeaseExpired {
            workflow_id: "wf".into(),
        };
        assert!(!expired.is_retryable());
    }

    #[test]
    fn test_execution_errors_retryable() {
        assert!(WavefrontError::timeout("dispatch", 500).is_retryable());
        assert!(WavefrontError::executor("compute", "boom").is_retryable());
        assert!(!WavefrontError::RetryExhausted {
            action_id: "a1".into(),
            attempts: 3,
            last_error: None,
        }
        .is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = WavefrontError::EpochConflict {
            workflow_id: "wf-1".into(),
            current: 7,
            carried: 5,
        };
        let s = err.to_string();
        assert!(s.contains("wf-1"));
        assert!(s.contains('7'));
        assert!(s.contains('5'));
    }
}
