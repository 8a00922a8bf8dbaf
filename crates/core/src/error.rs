//! Error types for workflow validation and execution.

/// Boxed cause carried by operation failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while validating, sorting or running a workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Bad params, ids or connections. Never retried.
    #[error("Invalid workflow: {0}")]
    Validation(String),

    /// The source edges contain a cycle through the named operation.
    #[error("Workflow contains a cycle through operation {0}")]
    CyclicGraph(String),

    /// An operation names a source that does not exist.
    #[error("Operation {operation} references unknown source {missing}")]
    UnsatisfiableSource { operation: String, missing: String },

    /// No handler is registered for the operation type.
    #[error("No handler registered for operation type {0}")]
    UnknownOperation(String),

    /// A handler returned an error; the remaining schedule was abandoned.
    #[error("Operation {id} failed: {source}")]
    OperationFailed {
        id: String,
        #[source]
        source: BoxError,
    },

    /// The run deadline expired.
    #[error("Workflow timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// The run was cancelled from outside (worker shutdown).
    #[error("Workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Whether the queue may retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }

    pub(crate) fn operation_failed(id: &str, err: anyhow::Error) -> Self {
        Self::OperationFailed {
            id: id.to_string(),
            source: err.into(),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
