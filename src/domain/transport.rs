// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by the
//! session, subscription and direct-messaging layers. It intentionally avoids
//! any reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible for connecting, delivering opaque
//! messages to subscribed consumers, correlating a single reply to a request,
//! and reporting connection-state transitions. Session lifecycle, handler
//! isolation and direct-message addressing are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::{lock_ignore_poison, ClientIdentity, Result, SessionConfig, SessionError};

/// Capacity of the per-connection status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Check subject syntax.
///
/// Subjects are `.`-separated tokens. Tokens must be non-empty and free of
/// whitespace. With `allow_wildcards`, a token may be `*` (exactly one token)
/// and the last token may be `>` (one or more tokens).
pub(crate) fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<()> {
    // ---
    let invalid = || SessionError::InvalidSubject(subject.to_string());

    if subject.is_empty() {
        return Err(invalid());
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;

    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        match *token {
            "*" if !allow_wildcards => return Err(invalid()),
            ">" if !allow_wildcards || i != last => return Err(invalid()),
            _ => {}
        }
    }

    Ok(())
}

/// A transport address (a concrete subject).
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Validate a concrete subject (no wildcards).
    pub fn parse(subject: &str) -> Result<Self> {
        validate_subject(subject, false)?;
        Ok(Self::from(subject))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription subject pattern.
///
/// Matching is token-wise: `*` matches exactly one token and a trailing `>`
/// matches one or more remaining tokens. `messages.>` matches
/// `messages.test` and `messages.a.b` but not `messages`.
///
/// The in-memory transport uses [`Subscription::matches`] as the reference
/// matching semantics; broker-backed transports delegate to the broker.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl Subscription {
    /// Validate a subject pattern (wildcards allowed).
    pub fn parse(pattern: &str) -> Result<Self> {
        validate_subject(pattern, true)?;
        Ok(Self::from(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a concrete subject falls under this pattern.
    pub fn matches(&self, subject: &str) -> bool {
        // ---
        let mut pattern = self.0.split('.');
        let mut subject = subject.split('.');

        loop {
            match (pattern.next(), subject.next()) {
                (Some(">"), Some(_)) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(p), Some(s)) if p == s => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl From<Address> for Subscription {
    fn from(address: Address) -> Self {
        // ---
        Subscription(address.0)
    }
}

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message headers. Names are case-sensitive.
pub type Headers = BTreeMap<String, String>;

/// An opaque message.
///
/// A `Message` is the unit of transport between producers and consumers.
/// The transport does not interpret the payload or headers; it routes on
/// `subject` and, for correlated sends, fills in `reply_to`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    // ---
    /// Concrete subject the message was published to.
    pub subject: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Reply subject, present when the sender awaits a response.
    pub reply_to: Option<Address>,

    pub headers: Headers,
}

impl Message {
    pub fn new(subject: impl Into<Address>, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply_to: None,
            headers: Headers::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<Address>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Decode the payload as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.to_vec())?)
    }
}

/// Lazy, unbounded stream of messages matching one subscription.
///
/// The stream ends when the subscription is released by the transport
/// (connection closed). Dropping the stream unsubscribes.
pub struct MessageStream {
    // ---
    /// Receiver channel for delivered messages matching this subscription.
    pub inbox: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    /// Wait for the next message; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }
}

/// Connection-state transition reported by a transport.
///
/// Status transitions are informational; they never surface as errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    /// The server announced it is about to shut down.
    LameDuck,
    /// Messages were dropped because a local consumer fell behind.
    SlowConsumer,
    Draining,
    /// Non-fatal error reported by the server or client library.
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Reconnecting => f.write_str("reconnecting"),
            ConnectionStatus::Reconnected => f.write_str("reconnected"),
            ConnectionStatus::LameDuck => f.write_str("lame duck"),
            ConnectionStatus::SlowConsumer => f.write_str("slow consumer"),
            ConnectionStatus::Draining => f.write_str("draining"),
            ConnectionStatus::Error(err) => write!(f, "error: {err}"),
        }
    }
}

/// Live sequence of connection-state transitions.
///
/// Ends once the connection is closed. A receiver that falls behind skips
/// the transitions it missed.
pub struct StatusStream {
    // ---
    rx: Option<broadcast::Receiver<ConnectionStatus>>,
}

impl StatusStream {
    pub(crate) fn new(rx: broadcast::Receiver<ConnectionStatus>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A stream that has already ended.
    pub(crate) fn ended() -> Self {
        Self { rx: None }
    }

    pub async fn next(&mut self) -> Option<ConnectionStatus> {
        // ---
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

/// How a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request.
    Graceful,
    /// Closed by the server or after reconnects were exhausted.
    Error(String),
}

/// Status and close signalling shared by all transport implementations.
pub struct ConnectionSignals {
    // ---
    status_tx: Mutex<Option<broadcast::Sender<ConnectionStatus>>>,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl ConnectionSignals {
    pub fn new() -> Self {
        // ---
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (closed_tx, _) = watch::channel(None);

        Self {
            status_tx: Mutex::new(Some(status_tx)),
            closed_tx,
        }
    }

    /// Report a status transition. Ignored once the connection is closed.
    pub fn emit(&self, status: ConnectionStatus) {
        // ---
        if let Some(tx) = lock_ignore_poison(&self.status_tx).as_ref() {
            // No receivers is not an error; nobody is listening yet.
            let _ = tx.send(status);
        }
    }

    pub fn status_stream(&self) -> StatusStream {
        // ---
        match lock_ignore_poison(&self.status_tx).as_ref() {
            Some(tx) => StatusStream::new(tx.subscribe()),
            None => StatusStream::ended(),
        }
    }

    /// Record the close outcome and end every status stream.
    ///
    /// Only the first call has an effect.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        // ---
        let first = self.closed_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });

        if first {
            lock_ignore_poison(&self.status_tx).take();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) -> CloseReason {
        // ---
        let mut rx = self.closed_tx.subscribe();
        let result = rx.wait_for(Option::is_some).await;

        match result {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Graceful),
            Err(_) => CloseReason::Graceful,
        }
    }
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared base state for all transport implementations.
///
/// Embeds common fields so that default `Transport` trait implementations
/// can delegate to this struct rather than repeating logic in each transport.
///
/// # Usage
///
/// Each concrete transport embeds this as a field named `base`:
///
/// ```ignore
/// struct NatsTransport {
///     base: TransportBase,
///     // ... nats specific fields
/// }
///
/// impl Transport for NatsTransport {
///     fn base(&self) -> &TransportBase { &self.base }
/// }
/// ```
pub struct TransportBase {
    /// Connection display name (the session's client identity).
    pub transport_id: String,
    /// Server address the transport connected to.
    pub server_address: String,
    pub signals: ConnectionSignals,
}

impl From<&TransportConfig> for TransportBase {
    /// Construct a `TransportBase` from a `TransportConfig` reference.
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.display_name.clone(),
            server_address: config.server_address.clone(),
            signals: ConnectionSignals::new(),
        }
    }
}

/// Configuration for creating a transport instance.
///
/// Passed to [`Connector::connect`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Server address (e.g. `"nats://localhost:4222"`, `"memory://"`)
    pub server_address: String,
    /// Connection name reported to the server.
    pub display_name: String,
    pub connect_timeout: Duration,
    pub reconnect: bool,
    pub max_reconnect_attempts: usize,
    pub ping_interval: Option<Duration>,
}

impl TransportConfig {
    /// Derive the connection settings for one session.
    pub fn for_session(identity: &ClientIdentity, config: &SessionConfig) -> Self {
        // ---
        Self {
            server_address: config.server_address.clone(),
            display_name: identity.to_string(),
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ping_interval: config.ping_interval,
        }
    }

    /// Build a `ConnectFailed` error for this config.
    pub fn connect_failed(&self, reason: impl fmt::Display) -> SessionError {
        SessionError::ConnectFailed {
            server: self.server_address.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Transport abstraction over a connected pub/sub client.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point and matching the subscription are deliverable.
/// - `request()` allocates a unique reply subject, waits for at most one
///   reply and fails with `RequestTimeout` no earlier than `timeout`.
/// - Concurrent `publish()`/`request()` calls from multiple tasks are safe.
/// - The status stream and `closed()` resolve once the connection is closed,
///   whether by `close()` or by the server.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. This is an implementation detail; consumers
/// should treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    ///
    /// Required method - each concrete transport must implement this
    /// by returning `&self.base`.
    fn base(&self) -> &TransportBase;

    /// Returns the connection display name.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    fn server_address(&self) -> &str {
        &self.base().server_address
    }

    /// Live stream of connection-state transitions.
    fn status_events(&self) -> StatusStream {
        self.base().signals.status_stream()
    }

    /// Resolves once the connection is closed, with the reason.
    async fn closed(&self) -> CloseReason {
        self.base().signals.closed().await
    }

    /// Fire-and-forget send. No delivery acknowledgment.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Register a subscription and return its message stream.
    async fn subscribe(&self, sub: Subscription) -> Result<MessageStream>;

    /// Correlated send: publish `msg` with a fresh reply subject and wait up
    /// to `timeout` for exactly one reply.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message>;

    /// Stop accepting new outbound work and flush in-flight work.
    async fn drain(&self) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;

/// Factory establishing one transport connection per call.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection.
    ///
    /// Fails with `ConnectFailed` if the server is unreachable within
    /// `config.connect_timeout`.
    async fn connect(&self, config: TransportConfig) -> Result<TransportPtr>;
}

pub type ConnectorPtr = Arc<dyn Connector>;
