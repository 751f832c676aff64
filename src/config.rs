//! Public, transport-agnostic session configuration.
//!
//! This type intentionally contains no transport-specific concepts
//! (e.g. NATS client options). Transport layers are responsible for
//! interpreting it, via [`TransportConfig`](crate::TransportConfig), into
//! concrete connection settings.

use std::time::Duration;

/// Default server address for broker-backed sessions.
pub const DEFAULT_SERVER_ADDRESS: &str = "nats://localhost:4222";

/// Server address selecting the process-global in-memory hub.
pub const MEMORY_SERVER_ADDRESS: &str = "memory://";

/// Session configuration and connection parameters.
///
/// # Example
///
/// ```
/// use mom_session::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::with_server("nats://localhost:4222")
///     .with_connect_timeout(Duration::from_secs(3))
///     .with_max_reconnect_attempts(10)
///     .with_ping_interval(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    // ---
    /// Server address. The scheme selects the transport
    /// (`nats://` or `memory://`).
    pub server_address: String,

    /// How long the initial connect may take before it fails.
    ///
    /// Default: 3 seconds
    pub connect_timeout: Duration,

    /// Whether the transport reconnects after a dropped connection.
    pub reconnect: bool,

    /// Reconnect attempts the transport makes before giving up.
    ///
    /// Default: 10
    pub max_reconnect_attempts: usize,

    /// Keep-alive ping interval. `None` uses the transport default.
    pub ping_interval: Option<Duration>,

    /// Deadline used by `Session::request` when no timeout is given.
    ///
    /// Default: 5 seconds
    pub request_timeout: Duration,

    /// Deadline for a direct message acknowledgment.
    ///
    /// Default: 5 seconds
    pub direct_ack_timeout: Duration,

    /// Deadline for a presence probe answer.
    ///
    /// Default: 250 milliseconds
    pub presence_probe_timeout: Duration,

    /// Probe the own inbox before opening it and fail with
    /// [`SessionError::IdentityInUse`](crate::SessionError::IdentityInUse)
    /// when another live session answers.
    ///
    /// Default: true
    pub reject_identity_collisions: bool,
}

impl SessionConfig {
    /// Create a new `SessionConfig` for the given server address.
    pub fn with_server(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// Create a config for the process-global in-memory hub (no broker).
    pub fn memory() -> Self {
        Self::with_server(MEMORY_SERVER_ADDRESS)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Disable transport-level reconnects.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.reconnect = true;
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Set the default request timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_session::SessionConfig;
    /// use std::time::Duration;
    ///
    /// let config = SessionConfig::memory()
    ///     .with_request_timeout(Duration::from_secs(1));
    /// assert_eq!(config.request_timeout, Duration::from_secs(1));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_direct_ack_timeout(mut self, timeout: Duration) -> Self {
        self.direct_ack_timeout = timeout;
        self
    }

    pub fn with_presence_probe_timeout(mut self, timeout: Duration) -> Self {
        self.presence_probe_timeout = timeout;
        self
    }

    /// Leave identity collisions unchecked; the last inbox subscriber and
    /// every earlier one all receive the traffic.
    pub fn allow_identity_collisions(mut self) -> Self {
        self.reject_identity_collisions = false;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        // ---
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(3),
            reconnect: true,
            max_reconnect_attempts: 10,
            ping_interval: None,
            request_timeout: Duration::from_secs(5),
            direct_ack_timeout: Duration::from_secs(5),
            presence_probe_timeout: Duration::from_millis(250),
            reject_identity_collisions: true,
        }
    }
}
