//! Pub/sub demo for the connection engine.
//!
//! # Purpose
//! Demonstrates the end-to-end flow: boot an in-process mock server, connect,
//! subscribe, publish, request/reply, and survive a server restart.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use anyhow::{Context, Result};
use std::time::Duration;
use tern_client::{ConnectOptions, Connection};
use test_harness::{MockServer, MockServerOptions};

async fn run_demo() -> Result<()> {
    println!("== Tern Pub/Sub Demo ==");
    println!("Goal: demonstrate publish/subscribe and request/reply over one connection.");

    println!("Step 1/6: booting an in-process mock server.");
    let server = MockServer::start().await.context("start server")?;
    let addr = server.addr().to_string();
    println!("Server listening on {addr}.");

    println!("Step 2/6: connecting the client.");
    let mut options =
        ConnectOptions::defaults(vec![server.url().parse().context("server url")?]);
    options.reconnect_wait = Duration::from_millis(200);
    let connection = Connection::new(options);
    connection.connect().await.context("connect")?;
    println!(
        "Connected; server reports itself as {}.",
        connection
            .server_info()
            .map(|info| info.server_name)
            .unwrap_or_default()
    );

    println!("Step 3/6: subscribing to demo.topic.");
    let mut subscription = connection.subscribe("demo.topic").context("subscribe")?;

    println!("Step 4/6: publishing two messages.");
    connection.publish("demo.topic", b"hello")?;
    connection.publish_wait("demo.topic", b"world").await?;
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), subscription.next()).await {
            Ok(Some(message)) => {
                println!(
                    "Message on {}: {}",
                    message.subject,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            Ok(None) => {
                println!("Subscription closed early.");
                break;
            }
            Err(_) => {
                println!("Timed out waiting for a message.");
                break;
            }
        }
    }

    println!("Step 5/6: serving and issuing a request.");
    let _responder = connection
        .subscribe_request("demo.echo", |request| Ok(request.payload))
        .context("install responder")?;
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        connection.request("demo.echo", b"ping"),
    )
    .await
    .context("request timed out")??;
    println!(
        "Request round-tripped: {}",
        String::from_utf8_lossy(&response.payload)
    );

    println!("Step 6/6: restarting the server to show reconnect + replay.");
    server.shutdown().await;
    let server = MockServer::bind(&addr, MockServerOptions::default())
        .await
        .context("restart server")?;
    // Wait for the replayed subscription to land on the new server.
    for _ in 0..100 {
        if server.subscription_count("demo.topic") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    server.publish("demo.topic", b"after-restart");
    match tokio::time::timeout(Duration::from_secs(3), subscription.next()).await {
        Ok(Some(message)) => println!(
            "Received after restart: {}",
            String::from_utf8_lossy(&message.payload)
        ),
        _ => println!("No message after restart."),
    }

    println!("Shutting down demo.");
    connection.dispose().await;
    server.shutdown().await;
    println!("Demo complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run_demo().await
}
