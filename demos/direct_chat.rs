//! Direct messaging example.
//!
//! Two sessions, `client1` and `client2`, open their direct inboxes and
//! exchange one acknowledged message each way.
//!
//! Run with: cargo run --example direct_chat
//!
//! Against a NATS server:
//!
//! ```text
//! SERVER_ADDRESS=nats://localhost:4222 cargo run --example direct_chat --features transport_nats
//! ```

use mom_session::{DirectMessage, HandlerError, Session, SessionConfig, MEMORY_SERVER_ADDRESS};

async fn open_client(identity: &str, server_address: &str) -> mom_session::Result<Session> {
    // ---
    let session = Session::open(identity, SessionConfig::with_server(server_address)).await?;

    let me = identity.to_string();
    session
        .on_direct_message(move |msg: DirectMessage| {
            let me = me.clone();
            async move {
                println!("[{me}] from {}: {}", msg.sender, msg.text()?);
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    Ok(session)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let server_address =
        std::env::var("SERVER_ADDRESS").unwrap_or_else(|_| MEMORY_SERVER_ADDRESS.to_string());

    let client1 = open_client("client1", &server_address).await?;
    let client2 = open_client("client2", &server_address).await?;

    let chat = async {
        let ack = client1.send_direct_message("client2", "Hello client2!").await?;
        println!("client1 got ack: {ack}");

        let ack = client2
            .send_direct_message("client1", "Hello back client1!")
            .await?;
        println!("client2 got ack: {ack}");

        let present = client1.probe_presence("client3").await?;
        println!("client3 present: {present}");

        Ok::<(), mom_session::SessionError>(())
    };

    tokio::select! {
        result = chat => result?,
        _ = tokio::signal::ctrl_c() => println!("Received Ctrl+C, shutting down..."),
    }

    let (closed1, closed2) = tokio::join!(client1.close(), client2.close());
    closed1?;
    closed2?;

    Ok(())
}
