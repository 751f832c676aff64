//! Client session layer over subject-based publish/subscribe.
//!
//! This library turns a broadcast pub/sub transport into a client session
//! with a managed connection lifecycle, supervised subscriptions,
//! request/reply correlation and acknowledged point-to-point delivery
//! between named clients.
//!
//! ```
//! use mom_session::{MemoryHub, Session, SessionConfig};
//!
//! # async fn example() -> mom_session::Result<()> {
//! let hub = MemoryHub::new();
//! let client1 = Session::open_with("client1", SessionConfig::memory(), hub.connector()).await?;
//! let client2 = Session::open_with("client2", SessionConfig::memory(), hub.connector()).await?;
//!
//! client2.subscribe_to_direct_messages().await?;
//!
//! let ack = client1.send_direct_message("client2", "Hello client2!").await?;
//! assert!(ack.contains("client2"));
//!
//! client1.close().await?;
//! client2.close().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

// Import all sub modules once...
mod macros;

mod domain;
mod transport;

mod direct;
mod session;
mod subscription;

mod config;
mod identity;
mod inbox;

mod error;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use session::{Session, SessionState, SENDER_HEADER};

pub use subscription::{MessageHandler, SubscriptionHandle, SubscriptionManager};

pub use direct::{
    //
    inbox_subject,
    DirectMessage,
    DirectMessageHandler,
    DIRECT_PREFIX,
    PROBE_HEADER,
    UNKNOWN_SENDER,
};

pub use config::{SessionConfig, DEFAULT_SERVER_ADDRESS, MEMORY_SERVER_ADDRESS};
pub use identity::ClientIdentity;
pub use inbox::{InboxId, REPLY_INBOX_PREFIX};

pub use error::{HandlerError, Result, SessionError};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    default_connector,
    MemoryHub,
};

#[cfg(feature = "transport_nats")]
pub use transport::{create_nats_transport, NatsConnector};

// --- public re-exports
pub use domain::{
    //
    Address,
    CloseReason,
    ConnectionSignals,
    ConnectionStatus,
    Connector,
    ConnectorPtr,
    Headers,
    Message,
    MessageStream,
    StatusStream,
    Subscription,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

/// Acquire a mutex, recovering the guard if a previous holder panicked.
///
/// All state guarded this way stays consistent across a panic (plain
/// inserts and removals), so poisoning carries no information here.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
