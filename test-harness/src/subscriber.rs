// Subscriber: connect, subscribe, print or count messages until done.
use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use tern_client::Connection;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tern-sub")]
#[command(about = "Subscribe to a subject and consume messages")]
struct Args {
    /// Server URL, e.g. nats://127.0.0.1:4222
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    server: String,

    /// Subject filter, wildcards allowed
    #[arg(long, default_value = "bench.>")]
    subject: String,

    /// Optional queue group
    #[arg(long)]
    queue_group: Option<String>,

    /// Stop after this many messages; 0 means run forever
    #[arg(long, default_value = "0")]
    count: usize,

    /// Print each payload instead of counting
    #[arg(long, default_value = "false")]
    print: bool,
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
    connection.connect().await.context("connect")?;

    let mut subscriber = match &args.queue_group {
        Some(group) => connection
            .subscribe_queue(&args.subject, group)
            .context("subscribe")?,
        None => connection.subscribe(&args.subject).context("subscribe")?,
    };
    info!(server = %args.server, subject = %args.subject, sid = subscriber.sid(), "subscribed");

    let mut received = 0usize;
    let mut started: Option<Instant> = None;
    while let Some(message) = subscriber.next().await {
        started.get_or_insert_with(Instant::now);
        received += 1;
        if args.print {
            println!(
                "[{}] {}",
                message.subject,
                String::from_utf8_lossy(&message.payload)
            );
        }
        if args.count > 0 && received >= args.count {
            break;
        }
    }
    if let Some(started) = started {
        let elapsed = started.elapsed();
        info!(
            received,
            elapsed_ms = elapsed.as_millis() as u64,
            "subscriber done"
        );
    }
    connection.dispose().await;
    Ok(())
}
