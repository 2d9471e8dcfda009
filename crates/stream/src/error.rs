use thiserror::Error;

/// Queue/network level failure.
///
/// Transport errors are retried by the caller with [`crate::TransportBackoff`]
/// and never count as a message-level processing attempt.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream closed")]
    Closed,
}

impl TransportError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the underlying connection should be re-established.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}
