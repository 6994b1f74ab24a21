// Stand up a mock server on a fixed port for manual client runs.
use anyhow::{Context, Result};
use clap::Parser;
use test_harness::{MockServer, MockServerOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tern-mock-server")]
#[command(about = "Run the in-process mock NATS server standalone")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:4222")]
    listen: String,

    /// Answer only each connection's first PING (exercises the watchdog)
    #[arg(long, default_value = "false")]
    silent_pings: bool,

    /// Require this auth token on CONNECT
    #[arg(long)]
    token: Option<String>,
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
    let server = MockServer::bind(
        &args.listen,
        MockServerOptions {
            silent_pings: args.silent_pings,
            required_token: args.token,
            advertised_urls: Vec::new(),
        },
    )
    .await
    .context("start mock server")?;
    info!(addr = %server.addr(), "mock server listening; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    server.shutdown().await;
    Ok(())
}
