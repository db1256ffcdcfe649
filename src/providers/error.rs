/// Store-level error with retry classification.
///
/// Backends return this to tell the scheduler whether an operation is worth
/// retrying on the next polling cycle.
///
/// Retryable: database busy/locked, connection timeouts, transient resource
/// exhaustion. Non-retryable: missing instances, corrupt records, duplicate
/// creates, lease-proof failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "apply_work_set", "raise_event").
    pub operation: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the operation may succeed on retry.
    pub retryable: bool,
}

impl StoreError {
    /// A transient error that may succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent error that will not succeed on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}
