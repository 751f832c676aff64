//! Subscription management.
//!
//! The manager is the glue between a transport [`MessageStream`] and
//! caller-supplied handlers. For every subscription it:
//! - subscribes on the transport,
//! - spawns one delivery task that drives the stream,
//! - invokes the handler for each message, sequentially and in arrival order,
//! - isolates handler failures so the delivery loop keeps running.
//!
//! ### Error handling
//!
//! Errors returned by a [`MessageHandler`] and panics raised inside one are
//! logged and absorbed. One bad message must not bring down the
//! subscription; delivery continues with the next message.
//!
//! ### Cancellation
//!
//! Cancellation is cooperative. The delivery task checks its token before
//! taking each message, so a handler invocation already running completes
//! and no further invocation starts. [`SubscriptionHandle::unsubscribe`]
//! returns only after the delivery task has exited.
//!
//! [`SubscriptionManager::shutdown`] may run inside a handler, e.g. a
//! handler that closes its session on a "quit" message. The delivery task
//! running that handler is cancelled but not joined; it exits as soon as
//! the handler returns.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_warn,
    HandlerError,
    Message,
    MessageStream,
    Result,
    SessionError,
    SessionState,
    Subscription,
    TransportPtr,
};

tokio::task_local! {
    /// `(manager, subscription)` whose handler the current task is running.
    static DELIVERING: (u64, u64);
}

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(1);

/// Caller-supplied message handling logic.
///
/// Implemented for any `Fn(Message) -> Future<Output = Result<(), HandlerError>>`
/// closure, so most callers never implement it by hand:
///
/// ```
/// # use mom_session::{HandlerError, Message, MessageHandler};
/// let handler = |msg: Message| async move {
///     println!("{}: {}", msg.subject, msg.text()?);
///     Ok::<(), HandlerError>(())
/// };
/// # fn assert_handler<H: MessageHandler>(_: H) {}
/// # assert_handler(handler);
/// ```
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a single message.
    ///
    /// Returning an error does not stop delivery; the error is logged and
    /// the next message is processed.
    async fn handle(&self, msg: Message) -> std::result::Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, msg: Message) -> std::result::Result<(), HandlerError> {
        (self)(msg).await
    }
}

struct Entry {
    // ---
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Tracks the subscriptions opened through one session.
pub struct SubscriptionManager {
    // ---
    /// Client identity, for log lines.
    owner: String,
    key: u64,
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// One active subscription.
///
/// Dropping the handle detaches it: delivery continues until
/// [`unsubscribe`](Self::unsubscribe) is called or the session closes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    // ---
    id: u64,
    subject: Subscription,
    cancel: CancellationToken,
    /// Fired by the delivery task when it exits.
    done: CancellationToken,
    manager: Weak<SubscriptionManager>,
}

impl SubscriptionHandle {
    // ---

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subject pattern this subscription listens on.
    pub fn subject(&self) -> &Subscription {
        &self.subject
    }

    /// Whether the delivery task is still running.
    pub fn is_active(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Request cancellation without waiting for the delivery task.
    ///
    /// This is the variant to use from inside the subscription's own
    /// handler, where waiting would never complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the subscription and wait for its delivery task to exit.
    ///
    /// Once this returns, the handler is never invoked again. Must not be
    /// awaited from within the subscription's own handler; use
    /// [`cancel`](Self::cancel) there.
    pub async fn unsubscribe(&self) {
        // ---
        self.cancel.cancel();
        self.done.cancelled().await;

        if let Some(manager) = self.manager.upgrade() {
            manager.forget(self.id);
        }
    }
}

impl SubscriptionManager {
    pub fn new(owner: impl Into<String>) -> Arc<Self> {
        // ---
        Arc::new(Self {
            owner: owner.into(),
            key: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of subscriptions whose delivery task is still running.
    pub fn active_count(&self) -> usize {
        // ---
        lock_ignore_poison(&self.entries)
            .values()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }

    /// Open a transport subscription and start its delivery task.
    ///
    /// # Errors
    ///
    /// Returns the transport's subscribe error, or `SessionNotConnected`
    /// once the manager has been shut down.
    pub async fn subscribe(
        self: &Arc<Self>,
        transport: &TransportPtr,
        subject: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::SessionNotConnected(SessionState::Closed));
        }

        let stream = transport.subscribe(subject.clone()).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let task = tokio::spawn(deliver(
            self.owner.clone(),
            (self.key, id),
            subject.clone(),
            stream,
            handler,
            cancel.clone(),
            done.clone(),
        ));

        let mut entries = lock_ignore_poison(&self.entries);

        // A shutdown that ran while we were subscribing has already drained
        // the registry; cancel here instead of leaking the task.
        if self.closed.load(Ordering::SeqCst) {
            cancel.cancel();
            return Err(SessionError::SessionNotConnected(SessionState::Closed));
        }
        entries.insert(id, Entry { cancel: cancel.clone(), task });
        drop(entries);

        log_debug!(client: self.owner, "subscribed to {subject} (#{id})");

        Ok(SubscriptionHandle {
            id,
            subject,
            cancel,
            done,
            manager: Arc::downgrade(self),
        })
    }

    /// Cancel every subscription and wait for all delivery tasks to exit.
    ///
    /// Called from within one of this manager's handlers, that handler's
    /// own delivery task is cancelled but not waited for.
    ///
    /// Further `subscribe` calls fail. Idempotent.
    pub async fn shutdown(&self) {
        // ---
        self.closed.store(true, Ordering::SeqCst);

        let entries: Vec<(u64, Entry)> = lock_ignore_poison(&self.entries).drain().collect();

        for (_, entry) in &entries {
            entry.cancel.cancel();
        }

        let current = DELIVERING.try_with(|current| *current).ok();

        for (id, entry) in entries {
            if current == Some((self.key, id)) {
                log_debug!(client: self.owner, "shutdown from handler of #{id}; not joining it");
                continue;
            }
            if let Err(_err) = entry.task.await {
                log_error!(client: self.owner, "delivery task failed: {_err}");
            }
        }
    }

    /// Signal every delivery task to stop without waiting for them.
    pub(crate) fn cancel_all(&self) {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        for entry in lock_ignore_poison(&self.entries).values() {
            entry.cancel.cancel();
        }
    }

    /// Whether subscription `id` is registered and still delivering.
    pub(crate) fn is_active(&self, id: u64) -> bool {
        // ---
        lock_ignore_poison(&self.entries)
            .get(&id)
            .is_some_and(|entry| !entry.task.is_finished())
    }

    fn forget(&self, id: u64) {
        lock_ignore_poison(&self.entries).remove(&id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    // ---
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

async fn deliver(
    owner: String,
    key: (u64, u64),
    subject: Subscription,
    mut stream: MessageStream,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    // ---
    let _done = done.drop_guard();

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(msg) => msg,
                None => {
                    log_debug!(client: owner, "stream for {subject} ended");
                    break;
                }
            },
        };

        let msg_subject = msg.subject.clone();
        let invocation = DELIVERING.scope(key, handler.handle(msg));
        let outcome = AssertUnwindSafe(invocation).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => {
                log_warn!(client: owner, "handler for {subject} failed on {msg_subject}: {_err}");
            }
            Err(panic) => {
                let _reason = panic_message(panic.as_ref());
                log_error!(
                    client: owner,
                    "handler for {subject} panicked on {msg_subject}: {_reason}"
                );
            }
        }
    }

    log_debug!(client: owner, "delivery for {subject} stopped");
}
