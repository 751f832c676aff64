// tests/transport_memory.rs

use bytes::Bytes;
use tokio::time::{timeout, Duration, Instant};

use mom_session::{
    // ---
    create_memory_transport_with_hub,
    Address,
    ClientIdentity,
    ConnectionStatus,
    MemoryHub,
    Message,
    SessionConfig,
    SessionError,
    Subscription,
    TransportConfig,
};

fn transport_config(name: &str) -> TransportConfig {
    // ---
    let identity = ClientIdentity::new(name).expect("valid identity");
    TransportConfig::for_session(&identity, &SessionConfig::memory())
}

#[tokio::test]
async fn memory_subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub(transport_config("mstpd"), hub)
        .await
        .expect("failed to create memory transport");

    let address = Address::from("test.address");

    let mut sub = transport
        .subscribe(address.clone().into())
        .await
        .expect("subscribe failed");

    let payload = Bytes::from_static(b"hello");

    // ---
    // Act
    // ---
    transport
        .publish(Message::new(address.clone(), payload.clone()).with_header("sender", "mstpd"))
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), sub.next())
        .await
        .expect("timed out waiting for message")
        .expect("subscription channel closed unexpectedly");

    assert_eq!(received.payload, payload);
    assert_eq!(received.subject, address);
    assert_eq!(received.header("sender"), Some("mstpd"));
}

#[tokio::test]
async fn memory_request_reaches_responder_across_connections() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let server = create_memory_transport_with_hub(transport_config("server"), hub.clone())
        .await
        .unwrap();
    let client = create_memory_transport_with_hub(transport_config("client"), hub.clone())
        .await
        .unwrap();

    let mut requests = server.subscribe(Subscription::from("user.>")).await.unwrap();

    let responder = {
        let server = server.clone();
        tokio::spawn(async move {
            let req = requests.next().await.expect("request");
            let reply_to = req.reply_to.clone().expect("reply subject");
            let body = format!("Processed {}", req.text().unwrap());
            server.publish(Message::new(reply_to, body)).await.unwrap();
        })
    };

    // ---
    // Act
    // ---
    let reply = client
        .request(Message::new("user.create", "alice"), Duration::from_secs(1))
        .await
        .expect("request failed");

    // ---
    // Assert
    // ---
    assert_eq!(reply.text().unwrap(), "Processed alice");
    responder.await.unwrap();
}

#[tokio::test]
async fn memory_request_without_responder_times_out_after_deadline() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub(transport_config("lonely"), hub)
        .await
        .unwrap();

    let deadline = Duration::from_millis(150);
    let started = Instant::now();

    let result = transport
        .request(Message::new("nobody.home", "ping"), deadline)
        .await;

    assert!(started.elapsed() >= deadline);
    match result {
        Err(SessionError::RequestTimeout { subject, timeout }) => {
            assert_eq!(subject, "nobody.home");
            assert_eq!(timeout, deadline);
        }
        other => panic!("expected RequestTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn memory_outage_with_reconnect_reports_transitions() {
    // ---
    let hub = MemoryHub::new();
    let transport = create_memory_transport_with_hub(transport_config("flaky"), hub.clone())
        .await
        .unwrap();
    let mut status = transport.status_events();

    hub.simulate_outage().await;

    assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
    assert_eq!(status.next().await, Some(ConnectionStatus::Reconnecting));
    assert_eq!(status.next().await, Some(ConnectionStatus::Reconnected));

    // Still usable
    transport.publish(Message::new("after", "outage")).await.unwrap();
    transport.close().await.unwrap();
    assert_eq!(status.next().await, None);
}

#[tokio::test]
async fn memory_connect_delay_beyond_timeout_fails() {
    // ---
    let hub = MemoryHub::new();
    hub.set_connect_delay(Duration::from_millis(500));

    let identity = ClientIdentity::new("slow").unwrap();
    let config = TransportConfig::for_session(
        &identity,
        &SessionConfig::memory().with_connect_timeout(Duration::from_millis(50)),
    );

    let result = create_memory_transport_with_hub(config, hub.clone()).await;

    assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    assert_eq!(hub.connection_count(), 0);
}
