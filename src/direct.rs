//! Point-to-point messaging over the broadcast substrate.
//!
//! Every session with identity `I` owns the inbox subject `direct.I`.
//! Sending is a correlated request to the target's inbox; the receiving
//! inbox handler answers on the reply subject with an acknowledgment
//! (`"Message received by <I>"`) before the caller's handler runs. The
//! acknowledgment therefore confirms receipt, not processing.
//!
//! A request carrying the [`PROBE_HEADER`] header is a presence probe: the
//! inbox answers it without invoking the caller's handler. Probes back
//! [`Session::probe_presence`] and the identity collision check performed
//! when an inbox is opened.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::session::{Inner, SENDER_HEADER};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Address,
    ClientIdentity,
    HandlerError,
    Message,
    MessageHandler,
    Result,
    Session,
    SessionError,
    Subscription,
    SubscriptionHandle,
};

/// Reserved subject namespace for direct inboxes.
pub const DIRECT_PREFIX: &str = "direct";

/// Header marking a presence probe.
pub const PROBE_HEADER: &str = "direct-probe";

/// Sender reported when an incoming direct message has no sender header.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Inbox subject owned by `identity`, e.g. `direct.client2`.
pub fn inbox_subject(identity: &ClientIdentity) -> Address {
    Address::from(format!("{DIRECT_PREFIX}.{identity}"))
}

fn ack_text(identity: &ClientIdentity) -> String {
    format!("Message received by {identity}")
}

/// An incoming point-to-point message.
#[derive(Debug, Clone)]
pub struct DirectMessage {
    /// Sender identity from the sender header, or [`UNKNOWN_SENDER`].
    pub sender: String,
    pub payload: Bytes,
    /// Reply subject of the underlying request, already acknowledged.
    pub reply_to: Option<Address>,
}

impl DirectMessage {
    /// Decode the payload as UTF-8.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.to_vec())?)
    }
}

impl From<Message> for DirectMessage {
    fn from(msg: Message) -> Self {
        // ---
        let sender = msg
            .header(SENDER_HEADER)
            .unwrap_or(UNKNOWN_SENDER)
            .to_string();

        Self {
            sender,
            payload: msg.payload,
            reply_to: msg.reply_to,
        }
    }
}

/// Caller-supplied logic for incoming direct messages.
///
/// Like [`MessageHandler`], implemented for async closures and isolated at
/// the subscription boundary: errors and panics are logged, not propagated.
#[async_trait::async_trait]
pub trait DirectMessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: DirectMessage) -> std::result::Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<F, Fut> DirectMessageHandler for F
where
    F: Fn(DirectMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, msg: DirectMessage) -> std::result::Result<(), HandlerError> {
        (self)(msg).await
    }
}

/// Inbox subscription handler: acknowledges, then delegates.
struct InboxHandler {
    // ---
    /// Weak so the delivery task does not keep its own session alive.
    session: Weak<Inner>,
    identity: ClientIdentity,
    handler: Arc<dyn DirectMessageHandler>,
}

#[async_trait::async_trait]
impl MessageHandler for InboxHandler {
    async fn handle(&self, msg: Message) -> std::result::Result<(), HandlerError> {
        // ---
        let Some(inner) = self.session.upgrade() else {
            return Ok(());
        };
        let session = Session { inner };
        let is_probe = msg.header(PROBE_HEADER).is_some();

        // Exactly one acknowledgment per message; not awaited by anyone
        // and not retried.
        if let Some(reply_to) = msg.reply_to.clone() {
            let ack = if is_probe {
                format!("{} is present", self.identity)
            } else {
                ack_text(&self.identity)
            };

            if let Err(_err) = session.publish_message(Message::new(reply_to, ack)).await {
                log_warn!(client: self.identity, "failed to acknowledge direct message: {_err}");
            }
        }

        if is_probe {
            log_debug!(client: self.identity, "answered presence probe");
            return Ok(());
        }

        let msg = DirectMessage::from(msg);
        log_debug!(client: self.identity, "direct message from {}", msg.sender);
        self.handler.handle(msg).await
    }
}

impl Session {
    // ---

    /// Open this session's direct inbox with a handler that logs each
    /// incoming message.
    pub async fn subscribe_to_direct_messages(&self) -> Result<SubscriptionHandle> {
        // ---
        let _identity = self.identity().clone();

        self.on_direct_message(move |msg: DirectMessage| {
            let _identity = _identity.clone();
            async move {
                let _text = msg.text()?;
                log_info!(
                    client: _identity,
                    "received direct message from {}: {_text}",
                    msg.sender
                );
                Ok::<(), HandlerError>(())
            }
        })
        .await
    }

    /// Open this session's direct inbox (`direct.<identity>`).
    ///
    /// Each incoming message is acknowledged on its reply subject before
    /// `handler` runs. At most one inbox may be open per session at a time.
    ///
    /// # Errors
    ///
    /// - `InboxAlreadyOpen` if the inbox is already open on this session.
    /// - `IdentityInUse` if collision checks are enabled and another live
    ///   session answers a probe on this identity's inbox.
    /// - `SessionNotConnected` outside the `Connected` state.
    pub async fn on_direct_message<H: DirectMessageHandler>(
        &self,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        // ---
        self.transport()?;

        let identity = self.identity().clone();

        // Held across the probe so concurrent opens serialize.
        let mut open = self.inner.direct_inbox.lock().await;

        if let Some(id) = *open {
            if self.inner.subscriptions.is_active(id) {
                return Err(SessionError::InboxAlreadyOpen(identity.to_string()));
            }
        }

        if self.inner.config.reject_identity_collisions && self.is_present(&identity).await? {
            log_warn!(client: identity, "another live session owns this identity");
            return Err(SessionError::IdentityInUse(identity.to_string()));
        }

        let handler = InboxHandler {
            session: Arc::downgrade(&self.inner),
            identity: identity.clone(),
            handler: Arc::new(handler),
        };

        let inbox = inbox_subject(&identity);
        let handle = self
            .subscribe_with(Subscription::from(inbox.clone()), Arc::new(handler))
            .await?;

        *open = Some(handle.id());
        log_info!(client: identity, "listening for direct messages on {inbox}");

        Ok(handle)
    }

    /// Send `payload` to `target`'s inbox and wait for its acknowledgment,
    /// using the configured `direct_ack_timeout`.
    ///
    /// Returns the acknowledgment text.
    ///
    /// # Errors
    ///
    /// `DirectDeliveryTimeout` if the target does not acknowledge in time.
    /// That covers both an absent and an overloaded target; use
    /// [`probe_presence`](Self::probe_presence) to tell them apart.
    pub async fn send_direct_message(
        &self,
        target: &str,
        payload: impl Into<Bytes>,
    ) -> Result<String> {
        // ---
        let timeout = self.inner.config.direct_ack_timeout;
        self.send_direct_message_with_timeout(target, payload, timeout)
            .await
    }

    /// [`send_direct_message`](Self::send_direct_message) with an explicit
    /// acknowledgment timeout.
    pub async fn send_direct_message_with_timeout(
        &self,
        target: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<String> {
        // ---
        let target = ClientIdentity::new(target)?;
        let msg = Message::new(inbox_subject(&target), payload)
            .with_header(SENDER_HEADER, self.identity().as_str());

        log_info!(client: self.identity(), "sending direct message to {target}");

        let ack = self
            .request_message(msg, timeout)
            .await
            .map_err(|err| match err {
                SessionError::RequestTimeout { timeout, .. } => {
                    SessionError::DirectDeliveryTimeout {
                        target: target.to_string(),
                        timeout,
                    }
                }
                other => other,
            })?;

        let ack = ack.text()?;
        log_info!(client: self.identity(), "acknowledgment: {ack}");
        Ok(ack)
    }

    /// Whether a live session currently answers on `target`'s inbox.
    ///
    /// Waits at most `presence_probe_timeout`. `Ok(false)` means nobody
    /// answered in time.
    pub async fn probe_presence(&self, target: &str) -> Result<bool> {
        // ---
        let target = ClientIdentity::new(target)?;
        self.is_present(&target).await
    }

    async fn is_present(&self, target: &ClientIdentity) -> Result<bool> {
        // ---
        let transport = self.transport()?;
        let timeout = self.inner.config.presence_probe_timeout;
        let probe = Message::new(inbox_subject(target), Bytes::new())
            .with_header(PROBE_HEADER, "1");

        match transport.request(self.tag(probe), timeout).await {
            Ok(_) => Ok(true),
            Err(SessionError::RequestTimeout { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
