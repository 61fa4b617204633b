//! Error types for RDMA queue operations.

use thiserror::Error;

use crate::verbs::CompletionStatus;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error variants surfaced by queue operations and the device layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Operation attempted on a queue in the wrong state.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// What the queue was doing when the operation was rejected.
        reason: String,
    },

    /// Absent handle, unknown token, or malformed request.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the offending argument.
        reason: String,
    },

    /// An allocation or hardware work queue ran out of room.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Which resource ran out.
        reason: String,
    },

    /// Unrecognized completion opcode, event, or oversized segment list.
    #[error("not supported: {reason}")]
    NotSupported {
        /// What was not supported.
        reason: String,
    },

    /// Nothing new is available yet. Always retryable.
    #[error("operation would block")]
    WouldBlock,

    /// Received payload does not follow the wire format.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the framing problem.
        reason: String,
    },

    /// The remote peer rejected the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that refused the connection.
        addr: String,
    },

    /// The remote peer disconnected an established connection.
    #[error("connection aborted by peer")]
    ConnectionAborted,

    /// Address resolution failed or timed out.
    #[error("address not available: {addr}")]
    AddressNotAvailable {
        /// The address that could not be resolved.
        addr: String,
    },

    /// Route resolution failed, or the operation is not permitted on this handle.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Description of the refused step.
        reason: String,
    },

    /// Local address is already bound by another connection id.
    #[error("address in use: {addr}")]
    AddressInUse {
        /// The contested address.
        addr: String,
    },

    /// A bounded wait expired.
    #[error("timed out after {timeout_ms}ms")]
    TimedOut {
        /// The wait bound in milliseconds.
        timeout_ms: u64,
    },

    /// The hardware reported a failed work completion. The link is no longer trustworthy.
    #[error("transport fault on work request {wr_id}: {status:?}")]
    TransportFault {
        /// Correlation id of the failed work request.
        wr_id: u64,
        /// Status reported by the completion queue.
        status: CompletionStatus,
    },

    /// Invalid queue configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Which setting is invalid.
        reason: String,
    },
}

impl QueueError {
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Returns true if the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Returns true if the error means the transport itself can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFault { .. })
    }

    /// Returns true if the queue that reported the error is no longer usable.
    pub fn is_terminal_for_queue(&self) -> bool {
        matches!(self, Self::ConnectionAborted | Self::TransportFault { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_retryable() {
        assert!(QueueError::WouldBlock.is_retryable());
        assert!(!QueueError::ConnectionAborted.is_retryable());
        assert!(!QueueError::protocol("short").is_retryable());
    }

    #[test]
    fn test_transport_fault_is_fatal() {
        let err = QueueError::TransportFault {
            wr_id: 7,
            status: CompletionStatus::RemoteError,
        };
        assert!(err.is_fatal());
        assert!(err.is_terminal_for_queue());
        assert!(format!("{}", err).contains("work request 7"));
    }

    #[test]
    fn test_refused_is_not_terminal() {
        let err = QueueError::ConnectionRefused {
            addr: "10.0.0.2:7000".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(!err.is_terminal_for_queue());
        assert_eq!(format!("{}", err), "connection refused to 10.0.0.2:7000");
    }

    #[test]
    fn test_aborted_is_terminal() {
        assert!(QueueError::ConnectionAborted.is_terminal_for_queue());
        assert!(!QueueError::ConnectionAborted.is_fatal());
    }

    #[test]
    fn test_protocol_violation_message() {
        let err = QueueError::protocol("received 4 bytes");
        assert_eq!(format!("{}", err), "protocol violation: received 4 bytes");
    }
}
