// Load-driving publisher: connect, publish N messages, report throughput.
use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};
use tern_client::Connection;
use tokio::time::sleep;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tern-pub")]
#[command(about = "Publish messages to a NATS server")]
struct Args {
    /// Server URL, e.g. nats://127.0.0.1:4222
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    server: String,

    /// Subject to publish on
    #[arg(long, default_value = "bench.updates")]
    subject: String,

    /// Number of messages
    #[arg(long, default_value = "10000")]
    count: usize,

    /// Payload size in bytes
    #[arg(long, default_value = "128")]
    payload_bytes: usize,

    /// Retry attempts for the initial connect
    #[arg(long, default_value = "10")]
    retry_attempts: u32,

    /// Retry delay in seconds
    #[arg(long, default_value = "1")]
    retry_delay: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let connection = Connection::from_url(&args.server).context("parse server url")?;

    for attempt in 1..=args.retry_attempts {
        match connection.connect().await {
            Ok(()) => break,
            Err(err) if attempt < args.retry_attempts => {
                error!(error = %err, attempt, "connect failed, retrying");
                sleep(Duration::from_secs(args.retry_delay)).await;
            }
            Err(err) => return Err(err).context("connect after all retries"),
        }
    }
    info!(server = %args.server, subject = %args.subject, "connected");

    let payload = vec![b'x'; args.payload_bytes];
    let started = Instant::now();
    for index in 0..args.count {
        if index + 1 == args.count {
            // Await the final write so the whole run is on the wire.
            connection
                .publish_wait(&args.subject, &payload)
                .await
                .context("publish")?;
        } else {
            connection.publish(&args.subject, &payload).context("publish")?;
        }
    }
    let elapsed = started.elapsed();
    info!(
        count = args.count,
        elapsed_ms = elapsed.as_millis() as u64,
        rate = (args.count as f64 / elapsed.as_secs_f64()) as u64,
        "publish run complete"
    );
    connection.dispose().await;
    Ok(())
}
