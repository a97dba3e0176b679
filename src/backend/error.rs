//! Backend error type with retry classification.

/// How a failed backend operation should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Might succeed on retry: locked database, timeouts, connection drops.
    Transient,
    /// Will not succeed on retry: corruption, invalid input, stale tokens.
    Permanent,
    /// Optimistic concurrency violation: history moved under the caller.
    /// Resolved by re-reading history and re-running the whole replay
    /// attempt, never by blind retry of the same write.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// Operation that failed (e.g. "append", "ack_orchestration_item").
    pub operation: String,
    pub message: String,
    pub kind: ErrorKind,
}

impl BackendError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ErrorKind::Transient,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ErrorKind::Permanent,
        }
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ErrorKind::Conflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for BackendError {}
