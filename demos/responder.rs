//! Responder example.
//!
//! Subscribes to `messages.>` and `user.>` and answers every request with
//! `"Processed <data> at <timestamp>"`. Plain publishes are logged.
//!
//! Run with: cargo run --example responder
//!
//! By default the in-memory transport is used and the example drives itself
//! with a local client. Against a NATS server:
//!
//! ```text
//! SERVER_ADDRESS=nats://localhost:4222 cargo run --example responder --features transport_nats
//! ```
//!
//! Stop with Ctrl+C; the session is drained and closed before exit.

use std::time::Duration;

use mom_session::{HandlerError, Message, Session, SessionConfig, MEMORY_SERVER_ADDRESS};

fn process(msg: &Message) -> String {
    // ---
    match msg.text() {
        Ok(data) => format!("Processed {data} at {}", chrono::Utc::now().to_rfc3339()),
        Err(err) => format!("Error: {err}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server_address =
        std::env::var("SERVER_ADDRESS").unwrap_or_else(|_| MEMORY_SERVER_ADDRESS.to_string());

    let session = Session::open("Responder", SessionConfig::with_server(&server_address)).await?;

    let mut handles = Vec::new();
    for subject in ["messages.>", "user.>"] {
        let responder = session.clone();

        let handle = session
            .subscribe(subject, move |msg: Message| {
                let responder = responder.clone();
                async move {
                    if msg.reply_to.is_none() {
                        println!("[{}] {}", msg.subject, msg.text()?);
                        return Ok(());
                    }
                    responder.respond(&msg, process(&msg)).await?;
                    Ok::<(), HandlerError>(())
                }
            })
            .await?;
        handles.push(handle);
    }

    println!("Listening on messages.> and user.> at {server_address}");

    if server_address == MEMORY_SERVER_ADDRESS {
        let client = Session::open("Publisher", SessionConfig::memory()).await?;

        client.publish("messages.test", "Hello from Publisher!").await?;
        let reply = client
            .request_with_timeout("user.create", "alice", Duration::from_secs(5))
            .await?;
        println!("Reply: {}", reply.text()?);

        client.close().await?;
    }

    // Run until Ctrl+C or until the connection goes away
    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Received Ctrl+C, shutting down..."),
        closed = session.closed() => {
            closed?;
            return Ok(());
        }
    }

    // A failed close exits non-zero
    session.close().await?;

    Ok(())
}
