use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

use mom_session::{
    //
    ConnectionStatus,
    HandlerError,
    MemoryHub,
    Message,
    Result,
    Session,
    SessionConfig,
    SessionError,
    SessionState,
};

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct AddResponse {
    sum: i32,
}

async fn open(hub: &Arc<MemoryHub>, identity: &str) -> Session {
    // ---
    Session::open_with(identity, SessionConfig::memory(), hub.connector())
        .await
        .expect("open failed")
}

#[tokio::test]
async fn test_lifecycle_states_and_status_events() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = Session::with_connector("Publisher", SessionConfig::memory(), hub.connector())?;
    let mut status = session.status_events();

    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect().await?;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(hub.connection_count(), 1);

    session.close().await?;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(hub.connection_count(), 0);
    session.closed().await?;

    assert_eq!(status.next().await, Some(ConnectionStatus::Connected));
    assert_eq!(status.next().await, Some(ConnectionStatus::Draining));
    assert_eq!(status.next().await, None);

    Ok(())
}

#[tokio::test]
async fn test_publish_subscribe_with_wildcards() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let publisher = open(&hub, "Publisher").await;
    let listener = open(&hub, "Listener").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = listener
        .subscribe("messages.>", move |msg: Message| {
            let tx = tx.clone();
            async move {
                let sender = msg.header("sender").unwrap_or_default().to_string();
                tx.send((msg.subject.to_string(), sender, msg.text()?))?;
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    publisher.publish("messages.test", "Hello from Publisher!").await?;
    publisher.publish("messages.other.deep", "second").await?;
    publisher.publish("user.create", "not for us").await?;

    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        first,
        (
            "messages.test".to_string(),
            "Publisher".to_string(),
            "Hello from Publisher!".to_string()
        )
    );

    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.0, "messages.other.deep");
    assert!(rx.try_recv().is_err());

    publisher.close().await?;
    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_request_respond_and_json() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = open(&hub, "math").await;
    let client = open(&hub, "Sally").await;

    let responder = server.clone();
    let _sub = server
        .subscribe("math.add", move |msg: Message| {
            let responder = responder.clone();
            async move {
                let req: AddRequest = serde_json::from_slice(&msg.payload)?;
                let resp = serde_json::to_vec(&AddResponse { sum: req.a + req.b })?;
                responder.respond(&msg, resp).await?;
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    let resp: AddResponse = client.request_json("math.add", &AddRequest { a: 2, b: 3 }).await?;
    assert_eq!(resp, AddResponse { sum: 5 });

    let raw = client.request("math.add", r#"{"a":20,"b":22}"#).await?;
    assert_eq!(raw.text()?, r#"{"sum":42}"#);

    client.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_respond_without_reply_subject() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let session = open(&hub, "lonely").await;

    let result = session.respond(&Message::new("x", "y"), "z").await;
    assert!(matches!(result, Err(SessionError::MissingReplySubject)));

    session.close().await
}

#[tokio::test]
async fn test_request_times_out_never_early() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "impatient").await;

    let deadline = Duration::from_millis(200);
    let started = Instant::now();
    let result = session
        .request_with_timeout("nobody.listens", "ping", deadline)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SessionError::RequestTimeout { .. })));
    assert!(elapsed >= deadline, "timed out early: {elapsed:?}");
    assert!(result.unwrap_err().is_recoverable());

    session.close().await
}

#[tokio::test]
async fn test_unsubscribe_stops_handler_invocations() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "counter").await;
    let count = Arc::new(AtomicUsize::new(0));

    let handle = {
        let count = count.clone();
        session
            .subscribe("ticks", move |_msg: Message| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok::<(), HandlerError>(())
                }
            })
            .await?
    };

    for _ in 0..20 {
        session.publish("ticks", "t").await?;
    }

    handle.unsubscribe().await;
    let seen = count.load(Ordering::SeqCst);

    for _ in 0..20 {
        session.publish("ticks", "t").await?;
    }
    sleep(Duration::from_millis(50)).await;

    assert!(!handle.is_active());
    assert_eq!(count.load(Ordering::SeqCst), seen);

    session.close().await
}

#[tokio::test]
async fn test_handler_errors_do_not_stop_delivery() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "tolerant").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = session
        .subscribe("jobs", move |msg: Message| {
            let tx = tx.clone();
            async move {
                let text = msg.text()?;
                if text == "bad" {
                    return Err("rejected bad job".into());
                }
                tx.send(text)?;
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    session.publish("jobs", "bad").await?;
    session.publish("jobs", vec![0xffu8, 0xfe]).await?;
    session.publish("jobs", "good").await?;

    let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(got.as_deref(), Some("good"));
    assert!(handle.is_active());

    session.close().await
}

#[tokio::test]
async fn test_concurrent_close_is_idempotent() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "closer").await;

    let handle = session
        .subscribe("anything", |_msg: Message| async { Ok::<(), HandlerError>(()) })
        .await?;

    let (a, b, c) = tokio::join!(session.close(), session.close(), session.close());
    a?;
    b?;
    c?;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!handle.is_active());

    // Closing again is a no-op
    session.close().await?;

    assert!(matches!(
        session.publish("anything", "late").await,
        Err(SessionError::SessionNotConnected(SessionState::Closed))
    ));
    Ok(())
}

#[tokio::test]
async fn test_close_from_inside_handler() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "quitter").await;
    let controller = open(&hub, "controller").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let closer = session.clone();
    let handle = session
        .subscribe("control", move |msg: Message| {
            let closer = closer.clone();
            let tx = tx.clone();
            async move {
                if msg.text()? == "quit" {
                    tx.send(closer.close().await.is_ok())?;
                }
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    controller.publish("control", "quit").await?;

    let closed_ok = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("close() inside a handler did not return");
    assert_eq!(closed_ok, Some(true));
    assert_eq!(session.state(), SessionState::Closed);

    timeout(Duration::from_secs(1), session.closed())
        .await
        .expect("closed() did not resolve")?;
    timeout(Duration::from_secs(1), session.close())
        .await
        .expect("repeat close() did not return")?;

    timeout(Duration::from_secs(1), async {
        while handle.is_active() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delivery task kept running after close");

    controller.close().await
}

#[tokio::test]
async fn test_blocked_handler_does_not_stall_other_subscriptions() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "juggler").await;
    let release = Arc::new(tokio::sync::Notify::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();

    let slow = {
        let release = release.clone();
        session
            .subscribe("slow", move |_msg: Message| {
                let release = release.clone();
                let started_tx = started_tx.clone();
                async move {
                    started_tx.send(())?;
                    release.notified().await;
                    Ok::<(), HandlerError>(())
                }
            })
            .await?
    };

    let _fast = session
        .subscribe("fast", move |msg: Message| {
            let fast_tx = fast_tx.clone();
            async move {
                fast_tx.send(msg.text()?)?;
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    session.publish("slow", "block").await?;
    timeout(Duration::from_secs(1), started_rx.recv())
        .await
        .expect("slow handler never started");

    for i in 0..3 {
        session.publish("fast", i.to_string()).await?;
    }
    for i in 0..3 {
        let got = timeout(Duration::from_secs(1), fast_rx.recv())
            .await
            .expect("fast subscription stalled behind the slow one");
        assert_eq!(got, Some(i.to_string()));
    }
    assert!(slow.is_active());

    release.notify_one();
    slow.unsubscribe().await;
    session.close().await
}

#[tokio::test]
async fn test_connect_failure_moves_to_failed() {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    hub.set_online(false);

    let session = Session::with_connector("doomed", SessionConfig::memory(), hub.connector())
        .unwrap();
    let result = session.connect().await;

    assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    assert_eq!(session.state(), SessionState::Failed);

    // Only close is valid afterwards, and it has nothing to do
    assert!(session.close().await.is_ok());
    assert!(session.closed().await.is_err());
    assert!(matches!(
        session.connect().await,
        Err(SessionError::AlreadyStarted(SessionState::Failed))
    ));
}

#[tokio::test]
async fn test_connect_timeout() {
    // ---
    let hub = MemoryHub::new();
    hub.set_connect_delay(Duration::from_millis(500));

    let config = SessionConfig::memory().with_connect_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let result = Session::open_with("slowpoke", config, hub.connector()).await;

    assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_outage_with_reconnect_keeps_session_usable() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "survivor").await;
    let mut status = session.status_events();

    hub.simulate_outage().await;

    assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
    assert_eq!(status.next().await, Some(ConnectionStatus::Reconnecting));
    assert_eq!(status.next().await, Some(ConnectionStatus::Reconnected));
    assert_eq!(session.state(), SessionState::Connected);

    session.publish("after.outage", "still here").await?;
    session.close().await
}

#[tokio::test]
async fn test_unexpected_close_closes_session() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let session = open(&hub, "abandoned").await;
    let mut status = session.status_events();

    let handle = session
        .subscribe("work", |_msg: Message| async { Ok::<(), HandlerError>(()) })
        .await?;

    hub.shutdown().await;

    let closed = timeout(Duration::from_secs(1), session.closed())
        .await
        .expect("session did not observe the close");

    match closed {
        Err(SessionError::Transport(reason)) => assert_eq!(reason, "server shut down"),
        other => panic!("expected transport close error, got {other:?}"),
    }

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!handle.is_active());
    assert_eq!(status.next().await, Some(ConnectionStatus::LameDuck));
    assert_eq!(status.next().await, None);

    // Closing after the fact is still fine
    session.close().await
}

#[tokio::test]
async fn test_outage_without_reconnect_closes_session() {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let config = SessionConfig::memory().without_reconnect();
    let session = Session::open_with("fragile", config, hub.connector())
        .await
        .unwrap();

    hub.simulate_outage().await;

    let closed = timeout(Duration::from_secs(1), session.closed()).await.unwrap();
    assert!(closed.is_err());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_run_until_closed_closes_on_error() {
    // ---
    let hub = MemoryHub::new();
    let session = open(&hub, "runner").await;

    let result: Result<()> = session
        .run_until_closed(async { Err(SessionError::RequestFailed("boom".into())) })
        .await;

    assert!(matches!(result, Err(SessionError::RequestFailed(_))));
    assert_eq!(session.state(), SessionState::Closed);
}

fn init_logging() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
