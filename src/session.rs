//! Client session.
//!
//! A [`Session`] owns exactly one transport connection and manages its
//! lifecycle:
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Draining ──▶ Closed
//!                       │
//!                       └──────▶ Failed
//! ```
//!
//! While connected, two supervised monitor tasks run: one forwards the
//! transport's status transitions to [`Session::status_events`], the other
//! waits for the connection to close and moves the session to `Closed` if
//! that happens unexpectedly. Both are joined by [`Session::close`].
//!
//! All outbound messages are tagged with the client identity in the
//! [`SENDER_HEADER`] header.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    // ---
    default_connector,
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    ClientIdentity,
    CloseReason,
    ConnectionSignals,
    ConnectionStatus,
    ConnectorPtr,
    Message,
    MessageHandler,
    Result,
    SessionConfig,
    SessionError,
    StatusStream,
    Subscription,
    SubscriptionHandle,
    SubscriptionManager,
    TransportConfig,
    TransportPtr,
};

/// Header carrying the sending session's identity.
pub const SENDER_HEADER: &str = "sender";

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, connect not yet attempted.
    Disconnected,
    Connecting,
    /// Publish, request and subscribe are valid only in this state.
    Connected,
    /// `close()` is cancelling subscriptions and draining the transport.
    Draining,
    Closed,
    /// The single connect attempt failed. Terminal.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A client session over one transport connection.
///
/// `Session` is cheap to clone; clones share the same connection, state and
/// subscriptions. There is no process-wide connection state: every
/// operation goes through an explicitly owned session.
///
/// # Example
///
/// ```
/// use mom_session::{HandlerError, Message, Session, SessionConfig};
///
/// # async fn example() -> mom_session::Result<()> {
/// let session = Session::open("Publisher", SessionConfig::memory()).await?;
///
/// let sub = session
///     .subscribe("messages.>", |msg: Message| async move {
///         println!("{}: {}", msg.subject, msg.text()?);
///         Ok::<(), HandlerError>(())
///     })
///     .await?;
///
/// session.publish("messages.test", "Hello!").await?;
///
/// sub.unsubscribe().await;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) identity: ClientIdentity,
    pub(crate) config: SessionConfig,
    connector: ConnectorPtr,
    state_tx: watch::Sender<SessionState>,
    transport: OnceLock<TransportPtr>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    /// Forwards transport status into `signals`.
    status_monitor: Mutex<Option<JoinHandle<()>>>,
    /// Waits for the transport to close.
    close_monitor: Mutex<Option<JoinHandle<()>>>,
    /// Session-level status fan-out and close outcome.
    signals: Arc<ConnectionSignals>,
    /// Subscription id of the open direct inbox, if any.
    pub(crate) direct_inbox: tokio::sync::Mutex<Option<u64>>,
}

impl Inner {
    // ---

    /// Move from `from` to `to`; false if the state was not `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        // ---
        self.state_tx.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }

    async fn wait_for_state(&self, pred: impl Fn(SessionState) -> bool) {
        // ---
        let mut rx = self.state_tx.subscribe();
        // The sender lives as long as `self`; the wait cannot fail.
        let _ = rx.wait_for(|state| pred(*state)).await;
    }

    /// Called by the close monitor once the transport connection is gone.
    async fn on_transport_closed(&self, reason: CloseReason) {
        // ---
        match &reason {
            CloseReason::Graceful => {
                log_info!(client: self.identity, "connection closed gracefully");
            }
            CloseReason::Error(_err) => {
                log_error!(client: self.identity, "connection closed with error: {_err}");
            }
        }

        self.wait_for_state(|state| state != SessionState::Connecting)
            .await;

        // A close() in progress owns the transition to Closed.
        if !self.transition(SessionState::Connected, SessionState::Draining) {
            return;
        }

        log_warn!(client: self.identity, "connection lost, closing session");
        self.subscriptions.shutdown().await;
        self.join_status_monitor().await;
        self.state_tx.send_replace(SessionState::Closed);
        self.signals.mark_closed(reason);
    }

    /// Wait for the last status transitions to be forwarded. The transport
    /// status stream ends once the transport is closed.
    async fn join_status_monitor(&self) {
        // ---
        let monitor = lock_ignore_poison(&self.status_monitor).take();
        if let Some(monitor) = monitor {
            if let Err(_err) = monitor.await {
                log_warn!(client: self.identity, "status monitor failed: {_err}");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        // Dropped without close(): stop background work so the connection
        // is released with the last transport handle.
        self.subscriptions.cancel_all();
        for slot in [&self.status_monitor, &self.close_monitor] {
            if let Some(monitor) = lock_ignore_poison(slot).take() {
                monitor.abort();
            }
        }
    }
}

impl Session {
    // ---

    /// Create a disconnected session; the connector is chosen from
    /// `config.server_address`.
    ///
    /// # Errors
    ///
    /// `InvalidIdentity` for an unusable identity, `UnsupportedAddress` when
    /// no transport handles the server address.
    pub fn new(identity: impl Into<String>, config: SessionConfig) -> Result<Self> {
        // ---
        let connector = default_connector(&config.server_address)?;
        Self::with_connector(identity, config, connector)
    }

    /// Create a disconnected session using an explicit connector.
    pub fn with_connector(
        identity: impl Into<String>,
        config: SessionConfig,
        connector: ConnectorPtr,
    ) -> Result<Self> {
        // ---
        let identity = ClientIdentity::new(identity)?;
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                subscriptions: SubscriptionManager::new(identity.to_string()),
                identity,
                config,
                connector,
                state_tx,
                transport: OnceLock::new(),
                status_monitor: Mutex::new(None),
                close_monitor: Mutex::new(None),
                signals: Arc::new(ConnectionSignals::new()),
                direct_inbox: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Create and connect a session.
    pub async fn open(identity: impl Into<String>, config: SessionConfig) -> Result<Self> {
        // ---
        let session = Self::new(identity, config)?;
        session.connect().await?;
        Ok(session)
    }

    /// Create and connect a session using an explicit connector.
    pub async fn open_with(
        identity: impl Into<String>,
        config: SessionConfig,
        connector: ConnectorPtr,
    ) -> Result<Self> {
        // ---
        let session = Self::with_connector(identity, config, connector)?;
        session.connect().await?;
        Ok(session)
    }

    /// Connect the transport and start the lifecycle monitors.
    ///
    /// A session makes at most one connect attempt. Retry policy, if any,
    /// lives in the transport's reconnect configuration.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` if the transport cannot connect (the session moves to
    /// `Failed`), `AlreadyStarted` if connect was already attempted.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let inner = &self.inner;

        if !inner.transition(SessionState::Disconnected, SessionState::Connecting) {
            return Err(SessionError::AlreadyStarted(self.state()));
        }

        log_info!(client: inner.identity, "connecting to {}", inner.config.server_address);

        let config = TransportConfig::for_session(&inner.identity, &inner.config);

        let transport = match inner.connector.connect(config.clone()).await {
            Ok(transport) => transport,
            Err(err) => {
                let err = match err {
                    err @ SessionError::ConnectFailed { .. } => err,
                    other => config.connect_failed(other),
                };
                log_error!(client: inner.identity, "connection failed: {err}");

                inner.state_tx.send_replace(SessionState::Failed);
                inner.signals.mark_closed(CloseReason::Error(err.to_string()));
                return Err(err);
            }
        };

        let _ = inner.transport.set(transport.clone());
        self.start_monitors(&transport);
        inner.state_tx.send_replace(SessionState::Connected);
        inner.signals.emit(ConnectionStatus::Connected);

        log_info!(client: inner.identity, "connected to {}", transport.server_address());
        Ok(())
    }

    fn start_monitors(&self, transport: &TransportPtr) {
        // ---
        let status_monitor = {
            let mut events = transport.status_events();
            let signals = self.inner.signals.clone();
            let _identity = self.inner.identity.clone();

            tokio::spawn(async move {
                while let Some(status) = events.next().await {
                    log_info!(client: _identity, "connection status: {status}");
                    signals.emit(status);
                }
                log_debug!(client: _identity, "status monitor stopped");
            })
        };

        let close_monitor = {
            let transport = transport.clone();
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);

            tokio::spawn(async move {
                let reason = transport.closed().await;
                drop(transport);

                if let Some(inner) = inner.upgrade() {
                    inner.on_transport_closed(reason).await;
                }
            })
        };

        *lock_ignore_poison(&self.inner.status_monitor) = Some(status_monitor);
        *lock_ignore_poison(&self.inner.close_monitor) = Some(close_monitor);
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Live stream of connection-state transitions, ending when the session
    /// closes. Transitions are informational and never raised as errors.
    pub fn status_events(&self) -> StatusStream {
        self.inner.signals.status_stream()
    }

    /// Wait until the session has closed (or failed to connect).
    ///
    /// # Errors
    ///
    /// Returns the captured close error when the connection ended with one.
    pub async fn closed(&self) -> Result<()> {
        // ---
        match self.inner.signals.closed().await {
            CloseReason::Graceful => Ok(()),
            CloseReason::Error(err) => Err(SessionError::Transport(err)),
        }
    }

    /// The transport, if the session is `Connected`.
    pub(crate) fn transport(&self) -> Result<TransportPtr> {
        // ---
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::SessionNotConnected(state));
        }
        self.inner
            .transport
            .get()
            .cloned()
            .ok_or(SessionError::SessionNotConnected(state))
    }

    pub(crate) fn tag(&self, mut msg: Message) -> Message {
        // ---
        msg.headers
            .entry(SENDER_HEADER.to_string())
            .or_insert_with(|| self.inner.identity.to_string());
        msg
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        // ---
        let msg = Message::new(Address::parse(subject)?, payload);
        self.publish_message(msg).await
    }

    /// Publish a fully built message (headers, reply subject).
    pub async fn publish_message(&self, msg: Message) -> Result<()> {
        // ---
        let transport = self.transport()?;
        log_debug!(client: self.inner.identity, "publishing to {}", msg.subject);

        let subject = msg.subject.clone();
        transport.publish(self.tag(msg)).await.map_err(|err| {
            log_error!(client: self.inner.identity, "publish to {subject} failed: {err}");
            err
        })
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<()> {
        // ---
        let payload = serde_json::to_vec(value)?;
        self.publish(subject, payload).await
    }

    /// Reply to a message that carries a reply subject.
    ///
    /// # Errors
    ///
    /// `MissingReplySubject` if the message was published without one.
    pub async fn respond(&self, msg: &Message, payload: impl Into<Bytes>) -> Result<()> {
        // ---
        let reply_to = msg
            .reply_to
            .clone()
            .ok_or(SessionError::MissingReplySubject)?;
        self.publish_message(Message::new(reply_to, payload)).await
    }

    /// Correlated send using the configured default request timeout.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Message> {
        // ---
        let timeout = self.inner.config.request_timeout;
        self.request_with_timeout(subject, payload, timeout).await
    }

    /// Correlated send with an explicit timeout.
    ///
    /// # Errors
    ///
    /// `RequestTimeout` if no reply arrives within `timeout`; never earlier.
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        // ---
        let msg = Message::new(Address::parse(subject)?, payload);
        self.request_message(msg, timeout).await
    }

    /// Correlated send of a fully built message.
    pub async fn request_message(&self, msg: Message, timeout: Duration) -> Result<Message> {
        // ---
        let transport = self.transport()?;
        log_debug!(client: self.inner.identity, "sending request to {}", msg.subject);

        let subject = msg.subject.clone();
        let reply = transport
            .request(self.tag(msg), timeout)
            .await
            .map_err(|err| {
                log_error!(client: self.inner.identity, "request to {subject} failed: {err}");
                err
            })?;

        log_debug!(client: self.inner.identity, "received response from {subject}");
        Ok(reply)
    }

    /// JSON request/response over [`request`](Self::request).
    pub async fn request_json<TReq, TResp>(&self, subject: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = serde_json::to_vec(req)?;
        let reply = self.request(subject, payload).await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// Subscribe to a subject pattern (wildcards allowed).
    ///
    /// The handler runs in a dedicated delivery task, one message at a
    /// time. Handler errors and panics are logged and do not stop delivery.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        subject: &str,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        // ---
        let pattern = Subscription::parse(subject)?;
        self.subscribe_with(pattern, Arc::new(handler)).await
    }

    pub(crate) async fn subscribe_with(
        &self,
        pattern: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        // ---
        let transport = self.transport()?;
        log_info!(client: self.inner.identity, "subscribing to {pattern}");

        self.inner
            .subscriptions
            .subscribe(&transport, pattern.clone(), handler)
            .await
            .map_err(|err| {
                log_error!(client: self.inner.identity, "subscribe to {pattern} failed: {err}");
                err
            })
    }

    /// Drain and close the session.
    ///
    /// Cancels every subscription, drains and closes the transport, joins
    /// the monitor tasks and moves the session to `Closed`. Calling it on a
    /// session that is already draining or closed waits for that close to
    /// finish and returns `Ok`. Closing a `Failed` session is a no-op.
    ///
    /// # Errors
    ///
    /// The first drain or close error reported by the transport. The session
    /// still ends up `Closed`.
    pub async fn close(&self) -> Result<()> {
        // ---
        let inner = &self.inner;

        loop {
            match self.state() {
                SessionState::Connected => {
                    if inner.transition(SessionState::Connected, SessionState::Draining) {
                        return self.shutdown().await;
                    }
                }
                SessionState::Disconnected => {
                    if inner.transition(SessionState::Disconnected, SessionState::Closed) {
                        inner.signals.mark_closed(CloseReason::Graceful);
                        return Ok(());
                    }
                }
                SessionState::Connecting => {
                    inner
                        .wait_for_state(|state| state != SessionState::Connecting)
                        .await;
                }
                SessionState::Failed => return Ok(()),
                SessionState::Draining | SessionState::Closed => {
                    inner
                        .wait_for_state(|state| state == SessionState::Closed)
                        .await;
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        log_info!(client: inner.identity, "closing connection...");

        inner.subscriptions.shutdown().await;

        let mut result = Ok(());

        if let Some(transport) = inner.transport.get() {
            if let Err(err) = transport.drain().await {
                log_error!(client: inner.identity, "drain failed: {err}");
                result = Err(err);
            }
            if let Err(err) = transport.close().await {
                log_error!(client: inner.identity, "close failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        inner.join_status_monitor().await;

        let close_monitor = lock_ignore_poison(&inner.close_monitor).take();
        if let Some(monitor) = close_monitor {
            if let Err(_err) = monitor.await {
                log_warn!(client: inner.identity, "close monitor failed: {_err}");
            }
        }

        let reason = match &result {
            Ok(()) => CloseReason::Graceful,
            Err(err) => CloseReason::Error(err.to_string()),
        };

        inner.state_tx.send_replace(SessionState::Closed);
        inner.signals.mark_closed(reason);

        log_info!(client: inner.identity, "connection closed");
        result
    }

    /// Run `fut`, then close the session regardless of its outcome.
    ///
    /// Returns the future's error first, else the close error.
    pub async fn run_until_closed<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // ---
        let outcome = fut.await;
        let closed = self.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}
