use std::fmt;
use std::sync::Arc;

/// Error kind for storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The broker rejected or failed a send. Never retried by the storage.
    PublishFailed,
    /// The fetch loop or the rebalance protocol failed; terminal for the subscription.
    SessionFailed,
    /// A pause/resume/seek command could not be executed.
    CommandFailed,
    /// Invalid configuration. Permanent; fail at startup.
    Config,
    /// Logical error (invalid state, misuse of a handle).
    Logic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::PublishFailed => f.write_str("publish failed"),
            ErrorKind::SessionFailed => f.write_str("session failed"),
            ErrorKind::CommandFailed => f.write_str("command failed"),
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Storage error returned by all storage trait methods.
///
/// Carries an [`ErrorKind`] so callers can tell a failed publish from a
/// dead subscription, a human-readable message, and optionally the
/// underlying cause reported by the broker client.
#[derive(Clone)]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into(), source: None }
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PublishFailed, msg)
    }

    pub fn session_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionFailed, msg)
    }

    pub fn command_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandFailed, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, msg)
    }

    /// Attach the underlying cause. Exposed through [`std::error::Error::source`].
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Add context to the error, preserving the original kind and cause.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
            source: self.source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " (caused by: {source})")?;
        }
        Ok(())
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// From impls: standard error types → StorageError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn context_keeps_kind_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broker went away");
        let err = StorageError::publish_failed("send rejected")
            .with_source(io)
            .with_context("topic 'orders'");

        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert_eq!(err.message(), "topic 'orders': send rejected");
        assert_eq!(err.to_string(), "publish failed: topic 'orders': send rejected");
        let cause = err.source().map(|s| s.to_string());
        assert_eq!(cause.as_deref(), Some("broker went away"));
    }

    #[test]
    fn json_errors_are_config_errors() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorageError = parse.into();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.source().is_none());
    }
}
