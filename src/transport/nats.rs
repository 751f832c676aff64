//! NATS transport implementation using `async-nats`.
//!
//! This module adapts the `async-nats` client to the domain-level `Transport`
//! trait without leaking NATS types upward.
//!
//! ## Concurrency model
//!
//! - `async_nats::Client` is internally synchronized and cheap to clone; all
//!   outbound operations go straight to it.
//! - Each `subscribe()` spawns a forwarder task that moves messages from the
//!   `async_nats::Subscriber` into the unbounded domain `MessageStream`. The
//!   forwarder stops when the stream is dropped or the transport closes.
//! - Connection events from the client's event callback are translated into
//!   [`ConnectionStatus`] transitions on the shared signals.
//!
//! ## Correlated sends
//!
//! `request()` allocates its own inbox, subscribes to it and then publishes
//! with that reply subject, so a missing responder surfaces as
//! `RequestTimeout` after the full deadline rather than as an early
//! "no responders" error.
//!
//! ## Usage
//!
//! Enable the `transport_nats` feature in your Cargo.toml:
//!
//! ```toml
//! [dependencies]
//! mom-session = { version = "0.1", features = ["transport_nats"] }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    CloseReason,
    ConnectionStatus,
    Connector,
    Headers,
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

/// NATS-based implementation of the `Transport` trait.
///
/// Represents a single server connection.
struct NatsTransport {
    // ---
    base: TransportBase,
    client: Mutex<Option<Client>>,
    draining: AtomicBool,
    /// Set by a `Disconnected` event; the next `Connected` is a reconnect.
    disconnected: AtomicBool,
    /// Fired on close; stops every forwarder task.
    shutdown: CancellationToken,
}

impl NatsTransport {
    // ---

    fn client(&self) -> Result<Client> {
        // ---
        if self.draining.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection draining".into()));
        }
        lock_ignore_poison(&self.client)
            .clone()
            .ok_or_else(|| SessionError::Transport("connection closed".into()))
    }

    async fn forward(&self, client: &Client, subject: String) -> Result<MessageStream> {
        // ---
        let mut subscriber = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| SessionError::Transport(format!("subscribe to {subject} failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = self.shutdown.clone();
        let _transport_id = self.base.transport_id.clone();

        tokio::spawn(async move {
            // ---
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    next = subscriber.next() => match next {
                        Some(msg) => {
                            if tx.send(from_nats(msg)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            if let Err(_err) = subscriber.unsubscribe().await {
                log_debug!(client: _transport_id, "unsubscribe from {subject} failed: {_err}");
            }
        });

        Ok(MessageStream { inbox: rx })
    }
}

fn to_nats_headers(headers: &Headers) -> HeaderMap {
    // ---
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_nats(msg: async_nats::Message) -> Message {
    // ---
    let mut headers = Headers::new();

    if let Some(map) = msg.headers.as_ref() {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }

    Message {
        subject: Address::from(msg.subject.as_str()),
        payload: msg.payload,
        reply_to: msg.reply.map(|reply| Address::from(reply.as_str())),
        headers,
    }
}

/// Translate a client event. `Connected` events arrive asynchronously and
/// may trail the initial connect, so only one following a `Disconnected`
/// counts as a reconnect.
fn status_from_event(event: Event, disconnected: &AtomicBool) -> Option<ConnectionStatus> {
    // ---
    match event {
        Event::Connected => disconnected
            .swap(false, Ordering::SeqCst)
            .then_some(ConnectionStatus::Reconnected),
        Event::Disconnected => {
            disconnected.store(true, Ordering::SeqCst);
            Some(ConnectionStatus::Disconnected)
        }
        Event::LameDuckMode => Some(ConnectionStatus::LameDuck),
        Event::SlowConsumer(_) => Some(ConnectionStatus::SlowConsumer),
        Event::ServerError(err) => Some(ConnectionStatus::Error(err.to_string())),
        Event::ClientError(err) => Some(ConnectionStatus::Error(err.to_string())),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        let client = self.client()?;
        let subject = msg.subject.to_string();
        let headers = to_nats_headers(&msg.headers);

        let result = match msg.reply_to {
            Some(reply) => {
                client
                    .publish_with_reply_and_headers(
                        subject.clone(),
                        reply.to_string(),
                        headers,
                        msg.payload,
                    )
                    .await
            }
            None => {
                client
                    .publish_with_headers(subject.clone(), headers, msg.payload)
                    .await
            }
        };

        result.map_err(|e| SessionError::Transport(format!("publish to {subject} failed: {e}")))
    }

    async fn subscribe(&self, sub: Subscription) -> Result<MessageStream> {
        // ---
        let client = self.client()?;
        self.forward(&client, sub.to_string()).await
    }

    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message> {
        // ---
        let client = self.client()?;
        let subject = msg.subject.to_string();

        // Subscribe to the inbox before publishing
        let inbox = client.new_inbox();
        let mut replies = client.subscribe(inbox.clone()).await.map_err(|e| {
            SessionError::RequestFailed(format!("reply inbox subscribe failed: {e}"))
        })?;

        client
            .publish_with_reply_and_headers(
                subject.clone(),
                inbox,
                to_nats_headers(&msg.headers),
                msg.payload,
            )
            .await
            .map_err(|e| SessionError::RequestFailed(format!("publish to {subject} failed: {e}")))?;

        let reply = tokio::time::timeout(timeout, replies.next())
            .await
            .map_err(|_| SessionError::RequestTimeout {
                subject: subject.clone(),
                timeout,
            })?
            .ok_or_else(|| {
                SessionError::RequestFailed(format!(
                    "connection closed while awaiting reply from {subject}"
                ))
            })?;

        let _ = replies.unsubscribe().await;
        Ok(from_nats(reply))
    }

    async fn drain(&self) -> Result<()> {
        // ---
        let client = self.client()?;
        self.draining.store(true, Ordering::SeqCst);
        self.base.signals.emit(ConnectionStatus::Draining);

        client
            .flush()
            .await
            .map_err(|e| SessionError::Transport(format!("flush failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        // Dropping the last client handle closes the connection.
        let client = lock_ignore_poison(&self.client).take();
        let result = match client {
            Some(client) => client
                .flush()
                .await
                .map_err(|e| SessionError::Transport(format!("flush on close failed: {e}"))),
            None => Ok(()),
        };

        if self.base.signals.mark_closed(CloseReason::Graceful) {
            log_info!(client: self.base.transport_id, "nats connection closed");
        }
        result
    }
}

/// Connector for `nats://` (and `tls://`) server addresses.
pub struct NatsConnector;

#[async_trait::async_trait]
impl Connector for NatsConnector {
    // ---
    async fn connect(&self, config: TransportConfig) -> Result<TransportPtr> {
        create_nats_transport(config).await
    }
}

/// Create a NATS transport.
///
/// # Errors
///
/// Returns `ConnectFailed` if the server cannot be reached within
/// `config.connect_timeout`.
pub async fn create_nats_transport(config: TransportConfig) -> Result<TransportPtr> {
    // ---
    log_info!(client: config.display_name, "connecting to NATS at {}", config.server_address);

    // The event callback outlives this function; it reaches the transport
    // through a weak slot filled once the transport exists.
    let slot: Arc<Mutex<Weak<NatsTransport>>> = Arc::new(Mutex::new(Weak::new()));
    let callback_slot = slot.clone();

    let max_reconnects = if config.reconnect {
        config.max_reconnect_attempts
    } else {
        0
    };

    let mut options = ConnectOptions::new()
        .name(config.display_name.as_str())
        .connection_timeout(config.connect_timeout)
        .max_reconnects(Some(max_reconnects))
        .event_callback(move |event| {
            let slot = callback_slot.clone();
            async move {
                let transport = lock_ignore_poison(&slot).upgrade();
                let Some(transport) = transport else {
                    return;
                };

                if matches!(event, Event::Closed) {
                    if transport
                        .base
                        .signals
                        .mark_closed(CloseReason::Error("connection closed by server".into()))
                    {
                        log_error!(
                            client: transport.base.transport_id,
                            "connection closed by server"
                        );
                    }
                    transport.shutdown.cancel();
                    return;
                }

                if let Some(status) = status_from_event(event, &transport.disconnected) {
                    log_warn!(client: transport.base.transport_id, "connection status {status}");
                    transport.base.signals.emit(status);
                }
            }
        });

    if let Some(interval) = config.ping_interval {
        options = options.ping_interval(interval);
    }

    let client = tokio::time::timeout(
        config.connect_timeout,
        options.connect(config.server_address.as_str()),
    )
    .await
    .map_err(|_| config.connect_failed(format!("timed out after {:?}", config.connect_timeout)))?
    .map_err(|e| config.connect_failed(e))?;

    let transport = Arc::new(NatsTransport {
        base: TransportBase::from(&config),
        client: Mutex::new(Some(client)),
        draining: AtomicBool::new(false),
        disconnected: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
    });

    *lock_ignore_poison(&slot) = Arc::downgrade(&transport);
    transport.base.signals.emit(ConnectionStatus::Connected);

    log_info!(client: config.display_name, "connected to NATS at {}", config.server_address);

    Ok(transport)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_initial_connected_event_is_not_a_reconnect() {
        // ---
        let disconnected = AtomicBool::new(false);

        assert_eq!(status_from_event(Event::Connected, &disconnected), None);
        assert_eq!(
            status_from_event(Event::Disconnected, &disconnected),
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(
            status_from_event(Event::Connected, &disconnected),
            Some(ConnectionStatus::Reconnected)
        );
        assert_eq!(status_from_event(Event::Connected, &disconnected), None);
    }
}
