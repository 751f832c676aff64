//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. All other transport implementations are expected to approximate this
//! behavior as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! In particular, the in-memory transport establishes the following expectations:
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point and matching the subscription are deliverable.
//! - Message delivery is deterministic within a single process and preserves
//!   publish order per subscriber.
//! - A request with no responder fails with `RequestTimeout` only once the
//!   full timeout has elapsed.
//! - Closing a connection ends its message streams and its status stream and
//!   leaves other connections on the same hub untouched.
//!
//! ## Fault injection
//!
//! [`MemoryHub`] can refuse or delay connects and can simulate an outage or a
//! server shutdown, so lifecycle handling can be exercised without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::inbox::InboxId;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    CloseReason,
    ConnectionStatus,
    Connector,
    ConnectorPtr,
    Message,
    MessageStream,
    Result,
    SessionError,
    Subscription,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

struct HubSubscriber {
    // ---
    id: u64,
    owner: u64,
    pattern: Subscription,
    tx: mpsc::UnboundedSender<Message>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All connections made
/// through the same hub can publish and receive each other's messages,
/// exactly as clients connected to a real server would.
///
/// # Usage in Integration Tests
///
/// For tests that need isolation between parallel test cases, construct a
/// hub explicitly and hand its connector to the session:
///
/// ```
/// # use mom_session::{MemoryHub, Session, SessionConfig};
/// # async fn example() -> mom_session::Result<()> {
/// let hub = MemoryHub::new();
///
/// let session = Session::open_with("client1", SessionConfig::memory(), hub.connector()).await?;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    subscriptions: RwLock<Vec<HubSubscriber>>,
    connections: Mutex<HashMap<u64, Weak<MemoryTransport>>>,
    next_id: AtomicU64,
    online: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl MemoryHub {
    /// Create a new, empty hub that accepts connections.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Connector establishing connections on this hub.
    pub fn connector(self: &Arc<Self>) -> ConnectorPtr {
        Arc::new(MemoryConnector { hub: self.clone() })
    }

    /// Accept (`true`) or refuse (`false`) new connections.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`, to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock_ignore_poison(&self.connect_delay) = delay;
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.live_connections().len()
    }

    /// Simulate a dropped and re-established network link.
    ///
    /// Connections configured to reconnect report `Disconnected`,
    /// `Reconnecting` and `Reconnected`; the others report `Disconnected`
    /// and close with an error.
    pub async fn simulate_outage(&self) {
        // ---
        for conn in self.live_connections() {
            conn.base.signals.emit(ConnectionStatus::Disconnected);

            if conn.reconnect {
                conn.base.signals.emit(ConnectionStatus::Reconnecting);
                conn.base.signals.emit(ConnectionStatus::Reconnected);
            } else {
                self.remove_owner(conn.conn_id).await;
                conn.terminate(CloseReason::Error("connection lost".into()));
            }
        }
    }

    /// Close every live connection with an error, as a server shutdown would.
    pub async fn shutdown(&self) {
        // ---
        for conn in self.live_connections() {
            conn.base.signals.emit(ConnectionStatus::LameDuck);
            self.remove_owner(conn.conn_id).await;
            conn.terminate(CloseReason::Error("server shut down".into()));
        }
    }

    fn live_connections(&self) -> Vec<Arc<MemoryTransport>> {
        // ---
        let mut connections = lock_ignore_poison(&self.connections);
        connections.retain(|_, conn| conn.strong_count() > 0);
        connections.values().filter_map(Weak::upgrade).collect()
    }

    async fn publish(&self, _transport_id: &str, msg: Message) -> Result<()> {
        // ---
        let mut stale = false;
        {
            let subs = self.subscriptions.read().await;

            for sub in subs.iter().filter(|s| s.pattern.matches(msg.subject.as_str())) {
                log_debug!(client: _transport_id, "publish {} to {}", msg.subject, sub.pattern);

                // A closed channel indicates a dropped MessageStream.
                if sub.tx.send(msg.clone()).is_err() {
                    stale = true;
                }
            }
        }

        if stale {
            let mut subs = self.subscriptions.write().await;
            subs.retain(|s| !s.tx.is_closed());
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        _transport_id: &str,
        owner: u64,
        sub: Subscription,
    ) -> (u64, MessageStream) {
        // ---
        log_debug!(client: _transport_id, "subscribe to {sub}");

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.subscriptions.write().await;
        subs.retain(|s| !s.tx.is_closed());
        subs.push(HubSubscriber {
            id,
            owner,
            pattern: sub,
            tx,
        });

        (id, MessageStream { inbox: rx })
    }

    async fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscriptions.write().await;
        subs.retain(|s| s.id != id);
    }

    /// Drop every subscription of one connection; its streams end.
    async fn remove_owner(&self, owner: u64) {
        let mut subs = self.subscriptions.write().await;
        subs.retain(|s| s.owner != owner);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: RwLock::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
            connect_delay: Mutex::new(Duration::ZERO),
        }
    }
}

/// Process-global hub used for `memory://` server addresses.
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

pub(crate) fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// One connection on a shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
    conn_id: u64,
    reconnect: bool,
    draining: AtomicBool,
}

impl MemoryTransport {
    // ---

    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.base.signals.is_closed() {
            return Err(SessionError::Transport("connection closed".into()));
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection draining".into()));
        }
        Ok(())
    }

    /// Mark the connection closed without touching hub subscriptions.
    fn terminate(&self, reason: CloseReason) {
        // ---
        if self.base.signals.mark_closed(reason) {
            lock_ignore_poison(&self.hub.connections).remove(&self.conn_id);
            log_info!(client: self.base.transport_id, "memory connection closed");
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    /// Publish a message to all matching subscriptions on the shared hub.
    async fn publish(&self, msg: Message) -> Result<()> {
        self.ensure_open()?;
        self.hub.publish(self.transport_id(), msg).await
    }

    /// Register a subscription on the shared hub.
    ///
    /// Once this function returns successfully, any subsequent calls to
    /// `publish()` with matching subjects are deliverable to the returned
    /// stream.
    async fn subscribe(&self, sub: Subscription) -> Result<MessageStream> {
        // ---
        self.ensure_open()?;
        let (_, stream) = self.hub.subscribe(self.transport_id(), self.conn_id, sub).await;
        Ok(stream)
    }

    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message> {
        // ---
        self.ensure_open()?;

        let inbox = InboxId::generate();
        let subject = msg.subject.to_string();

        let (sub_id, mut replies) = self
            .hub
            .subscribe(self.transport_id(), self.conn_id, inbox.address().into())
            .await;

        let outcome = async {
            self.hub
                .publish(self.transport_id(), msg.with_reply_to(inbox.address()))
                .await?;

            match tokio::time::timeout(timeout, replies.next()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(SessionError::RequestFailed(format!(
                    "connection closed while awaiting reply from {subject}"
                ))),
                Err(_) => Err(SessionError::RequestTimeout { subject, timeout }),
            }
        }
        .await;

        self.hub.unsubscribe(sub_id).await;
        outcome
    }

    async fn drain(&self) -> Result<()> {
        // ---
        if !self.draining.swap(true, Ordering::SeqCst) {
            self.base.signals.emit(ConnectionStatus::Draining);
        }
        // Delivery is synchronous; nothing is buffered in flight.
        Ok(())
    }

    /// Close the connection.
    ///
    /// Removes this connection's subscriptions only; other connections on
    /// the same hub keep working.
    async fn close(&self) -> Result<()> {
        // ---
        self.draining.store(true, Ordering::SeqCst);
        self.hub.remove_owner(self.conn_id).await;
        self.terminate(CloseReason::Graceful);
        Ok(())
    }
}

struct MemoryConnector {
    // ---
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    // ---
    async fn connect(&self, config: TransportConfig) -> Result<TransportPtr> {
        create_memory_transport_with_hub(config, self.hub.clone()).await
    }
}

/// Create a new in-memory connection on the process-global hub.
///
/// All connections created with this function share a single message bus,
/// matching the semantics of clients connected to one real server.
///
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
pub async fn create_memory_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory connection on the provided hub.
///
/// # Errors
///
/// Returns `ConnectFailed` if the hub is offline or the configured connect
/// delay exceeds `config.connect_timeout`.
pub async fn create_memory_transport_with_hub(
    config: TransportConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!(client: config.display_name, "create memory transport");

    let delay = *lock_ignore_poison(&hub.connect_delay);

    let handshake = async {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        hub.online.load(Ordering::SeqCst)
    };

    match tokio::time::timeout(config.connect_timeout, handshake).await {
        Ok(true) => {}
        Ok(false) => return Err(config.connect_failed("server unreachable")),
        Err(_) => {
            return Err(config.connect_failed(format!(
                "timed out after {:?}",
                config.connect_timeout
            )))
        }
    }

    let conn_id = hub.next_id.fetch_add(1, Ordering::Relaxed);

    let transport = Arc::new(MemoryTransport {
        base: TransportBase::from(&config),
        hub: hub.clone(),
        conn_id,
        reconnect: config.reconnect && config.max_reconnect_attempts > 0,
        draining: AtomicBool::new(false),
    });

    lock_ignore_poison(&hub.connections).insert(conn_id, Arc::downgrade(&transport));
    transport.base.signals.emit(ConnectionStatus::Connected);

    Ok(transport)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::SessionConfig;

    fn config(name: &str) -> TransportConfig {
        // ---
        let identity = crate::ClientIdentity::new(name).unwrap();
        TransportConfig::for_session(&identity, &SessionConfig::memory())
    }

    #[tokio::test]
    async fn test_wildcard_fanout() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub(config("t"), hub.clone())
            .await
            .unwrap();

        let mut all = transport.subscribe(Subscription::from("messages.>")).await.unwrap();
        let mut exact = transport.subscribe(Subscription::from("messages.test")).await.unwrap();

        transport.publish(Message::new("messages.test", "one")).await.unwrap();
        transport.publish(Message::new("messages.other", "two")).await.unwrap();

        assert_eq!(all.next().await.unwrap().payload, "one");
        assert_eq!(all.next().await.unwrap().payload, "two");
        assert_eq!(exact.next().await.unwrap().payload, "one");
        assert!(exact.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_keeps_other_connections() {
        // ---
        let hub = MemoryHub::new();
        let a = create_memory_transport_with_hub(config("a"), hub.clone()).await.unwrap();
        let b = create_memory_transport_with_hub(config("b"), hub.clone()).await.unwrap();

        let mut a_stream = a.subscribe(Subscription::from("x")).await.unwrap();
        let mut b_stream = b.subscribe(Subscription::from("x")).await.unwrap();

        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(a_stream.next().await.is_none());
        assert!(a.publish(Message::new("x", "late")).await.is_err());

        b.publish(Message::new("x", "still here")).await.unwrap();
        assert_eq!(b_stream.next().await.unwrap().payload, "still here");
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_hub_refuses_connect() {
        // ---
        let hub = MemoryHub::new();
        hub.set_online(false);

        let result = create_memory_transport_with_hub(config("c"), hub).await;
        assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_outage_without_reconnect_closes() {
        // ---
        let hub = MemoryHub::new();
        let mut cfg = config("d");
        cfg.reconnect = false;

        let transport = create_memory_transport_with_hub(cfg, hub.clone()).await.unwrap();
        let mut status = transport.status_events();

        hub.simulate_outage().await;

        assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
        assert_eq!(status.next().await, None);
        assert_eq!(
            transport.closed().await,
            CloseReason::Error("connection lost".into())
        );
    }
}
