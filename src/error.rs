//! Error types for the correlation layer

use crate::node::Node;
use std::fmt;
use thiserror::Error;

/// A transport-level failure, keeping whatever the remote side sent.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportFailure {
    /// Human-readable failure detail.
    pub detail: String,
    /// Error condition name, when the transport reports one
    /// (e.g. `item-not-found`).
    pub condition: Option<String>,
    /// The original inbound payload that carried the error.
    pub payload: Option<Node>,
}

impl TransportFailure {
    /// Failure with a detail string only.
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            condition: None,
            payload: None,
        }
    }

    /// Attach the error condition name.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Attach the original inbound payload.
    pub fn with_payload(mut self, payload: Node) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(condition) => write!(f, "{} ({})", self.detail, condition),
            None => f.write_str(&self.detail),
        }
    }
}

/// Errors surfaced by connections, the action translator and commands.
#[derive(Debug, PartialEq, Error)]
#[non_exhaustive]
pub enum CallCtlError {
    /// A call-scoped command targets a call whose domain was never learned.
    #[error("no known domain for call {call_id}")]
    Routing { call_id: String },

    /// The transport failed or the remote side answered with an error.
    #[error("transport error: {0}")]
    Transport(TransportFailure),

    /// No reply arrived within the configured window.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Inbound message of an unexpected shape; fatal to its connection.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// A transport request id was registered twice.
    #[error("transport request id {transport_id} is already pending")]
    DuplicateRequest { transport_id: String },

    /// A second completion outcome was offered to a command.
    #[error("command {command_id} is already complete")]
    AlreadyComplete { command_id: String },

    /// The command cannot be issued in its current form or state.
    #[error("invalid command: {message}")]
    InvalidCommand { message: String },

    /// The link is not connected.
    #[error("not connected")]
    NotConnected,

    /// The link closed while a request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Events were dropped because the application fell behind.
    #[error("event queue full, events were dropped")]
    QueueFull,
}

impl CallCtlError {
    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create an invalid command error
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Whether this error ends the owning connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallCtlError::ProtocolViolation { .. } | CallCtlError::ConnectionClosed
        )
    }
}

impl From<TransportFailure> for CallCtlError {
    fn from(failure: TransportFailure) -> Self {
        CallCtlError::Transport(failure)
    }
}

/// Result type alias for this crate
pub type CallCtlResult<T> = Result<T, CallCtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_display() {
        let failure = TransportFailure::new("cancel").with_condition("item-not-found");
        assert_eq!(failure.to_string(), "cancel (item-not-found)");
        assert_eq!(
            CallCtlError::from(failure).to_string(),
            "transport error: cancel (item-not-found)"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(CallCtlError::protocol_violation("bad stanza").is_fatal());
        assert!(CallCtlError::ConnectionClosed.is_fatal());
        assert!(!CallCtlError::Timeout { timeout_ms: 3000 }.is_fatal());
        assert!(!CallCtlError::Routing {
            call_id: "c1".into()
        }
        .is_fatal());
    }
}
