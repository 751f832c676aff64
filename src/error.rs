use std::time::Duration;

use thiserror::Error;

use crate::SessionState;

/// Error raised by caller-supplied message handlers.
///
/// Handler errors never propagate out of a subscription; they are logged
/// at the subscription boundary and delivery continues.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server was unreachable, the handshake failed or the connect
    /// timeout elapsed. Fatal to the session.
    #[error("connect to {server} failed: {reason}")]
    ConnectFailed { server: String, reason: String },

    /// Operation attempted outside the `Connected` state
    #[error("session is not connected (state: {0})")]
    SessionNotConnected(SessionState),

    /// A session performs at most one connect attempt
    #[error("connect already attempted (state: {0})")]
    AlreadyStarted(SessionState),

    /// No reply arrived before the deadline
    #[error("request to {subject} timed out after {timeout:?}")]
    RequestTimeout { subject: String, timeout: Duration },

    /// The target inbox did not acknowledge before the deadline.
    ///
    /// Either no session holds the target identity or its handler is too
    /// slow to answer; the two cases are indistinguishable.
    #[error("direct message to {target} not acknowledged within {timeout:?}")]
    DirectDeliveryTimeout { target: String, timeout: Duration },

    /// The transport failed while a request was outstanding
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Publish, subscribe, drain or close failure reported by the transport
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid client identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Another live session answered a probe on this identity's inbox
    #[error("client identity {0} is already in use by a live session")]
    IdentityInUse(String),

    #[error("direct inbox already open for {0}")]
    InboxAlreadyOpen(String),

    /// `respond()` was called on a message without a reply subject
    #[error("message has no reply subject")]
    MissingReplySubject,

    #[error("payload is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No connector is available for the server address scheme
    #[error("unsupported server address: {0}")]
    UnsupportedAddress(String),
}

impl SessionError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Nothing in this crate retries automatically; this is for callers
    /// deciding on their own backoff.
    pub fn is_recoverable(&self) -> bool {
        // ---
        matches!(
            self,
            SessionError::SessionNotConnected(_)
                | SessionError::RequestTimeout { .. }
                | SessionError::DirectDeliveryTimeout { .. }
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_timeouts_are_recoverable() {
        // ---
        let err = SessionError::RequestTimeout {
            subject: "user.get".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_recoverable());

        let err = SessionError::DirectDeliveryTimeout {
            target: "client2".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("client2"));
    }

    #[test]
    fn test_connect_failed_is_fatal() {
        // ---
        let err = SessionError::ConnectFailed {
            server: "nats://localhost:4222".into(),
            reason: "connection refused".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "connect to nats://localhost:4222 failed: connection refused"
        );
    }
}
