//! Error types for the broker core.

use burrow_protocol::ProtocolError;
use burrow_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No live connection to the broker.
    #[error("Not connected")]
    NotConnected,

    /// The delivery carries no acknowledgement handle.
    #[error("Delivery cannot be acknowledged")]
    NotAcknowledged,

    /// The delivery carries no rejection handle.
    #[error("Delivery cannot be rejected")]
    NotRejected,

    /// The delivery was already acknowledged or rejected.
    #[error("Delivery already settled")]
    AlreadySettled,

    /// Envelope encoding or decoding failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A transport operation failed.
    #[error("{op} failed: {source}")]
    Transport {
        /// Operation that failed.
        op: &'static str,
        /// Underlying transport error.
        source: TransportError,
    },

    /// The liveness probe failed.
    #[error("Liveness probe failed: {0}")]
    Probe(#[from] ProbeError),
}

impl BrokerError {
    /// Wrap a transport error with the operation that produced it.
    pub(crate) fn transport(op: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::Transport { op, source }
    }
}

/// Liveness probe failures.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No reply arrived in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A reply arrived with an unexpected correlation id.
    #[error("Correlation id mismatch: expected {expected:?}, got {got:?}")]
    CorrelationMismatch {
        /// Correlation id the probe sent.
        expected: String,
        /// Correlation id that came back.
        got: Option<String>,
    },

    /// The reply stream ended before a reply arrived.
    #[error("Reply stream closed")]
    StreamClosed,

    /// The probe queue could not be removed.
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// The probe task was cancelled by a runtime shutdown.
    #[error("Probe task interrupted")]
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_carries_operation() {
        let err = BrokerError::transport("queue.bind")(TransportError::Closed);
        assert_eq!(err.to_string(), "queue.bind failed: Connection closed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_probe_error_display() {
        let err = BrokerError::from(ProbeError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.to_string(), "Liveness probe failed: Timed out after 1s");
    }
}
