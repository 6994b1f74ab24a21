// Reconnection: replay, watchdog-driven teardown, advertised URLs.
use anyhow::Result;
use std::time::Duration;
use tern_client::{ConnectOptions, Connection, State};
use test_harness::{MockServer, MockServerOptions};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn options_for(server: &MockServer) -> ConnectOptions {
    let mut options =
        ConnectOptions::defaults(vec![server.url().parse().expect("server url")]);
    options.connect_timeout = Duration::from_secs(2);
    options.reconnect_wait = Duration::from_millis(50);
    options.reconnect_jitter = Duration::from_millis(20);
    options
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within the polling window");
}

#[tokio::test]
async fn subscriptions_replay_onto_a_restarted_server() -> Result<()> {
    let server = MockServer::start().await?;
    let addr = server.addr().to_string();
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let mut subscriber = connection.subscribe("r")?;
    wait_until(|| server.subscription_count("r") == 1).await;

    // Kill the server, then bring a fresh one up on the same port.
    server.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let server = MockServer::bind(&addr, MockServerOptions::default()).await?;

    // The replayed SUB must reappear at the new server by the next Open.
    wait_until(|| server.subscription_count("r") == 1).await;
    wait_until({
        let connection = connection.clone();
        move || connection.state() == State::Open
    })
    .await;

    // A sidecar publish on the new server reaches the old subscriber.
    server.publish("r", b"v");
    let message = timeout(WAIT, subscriber.next()).await?.expect("message");
    assert_eq!(message.payload.as_ref(), b"v");

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn publishes_enqueued_while_down_flush_after_reconnect() -> Result<()> {
    let server = MockServer::start().await?;
    let addr = server.addr().to_string();
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let mut subscriber = connection.subscribe("q")?;
    wait_until(|| server.subscription_count("q") == 1).await;

    server.shutdown().await;
    wait_until({
        let connection = connection.clone();
        move || connection.state() == State::Reconnecting
    })
    .await;

    // Queued while the socket is down; flushed once the next socket opens.
    connection.publish("q", b"while-down")?;

    let server = MockServer::bind(&addr, MockServerOptions::default()).await?;
    let message = timeout(WAIT, subscriber.next()).await?.expect("message");
    assert_eq!(message.payload.as_ref(), b"while-down");

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unanswered_pings_abort_the_socket_and_reconnect() -> Result<()> {
    let server = MockServer::start_with(MockServerOptions {
        silent_pings: true,
        ..MockServerOptions::default()
    })
    .await?;
    let mut options = options_for(&server);
    options.ping_interval = Duration::from_millis(100);
    options.max_pings_out = 2;
    let connection = Connection::new(options);
    connection.connect().await?;
    assert_eq!(server.connect_count(), 1);

    // Watchdog fires after max-pings-out+1 unanswered pings and the
    // supervisor dials the (still silent) server again.
    wait_until(|| server.connect_count() >= 2).await;

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reconnect_uses_advertised_urls_from_info() -> Result<()> {
    // The fallback server is where the advertised URL points.
    let fallback = MockServer::start().await?;
    let primary = MockServer::start_with(MockServerOptions {
        advertised_urls: vec![fallback.addr().to_string()],
        ..MockServerOptions::default()
    })
    .await?;

    let connection = Connection::new(options_for(&primary));
    connection.connect().await?;
    assert_eq!(primary.connect_count(), 1);

    let mut subscriber = connection.subscribe("adv")?;
    wait_until(|| primary.subscription_count("adv") == 1).await;

    primary.shutdown().await;

    // The client lands on the advertised fallback and replays the SUB there.
    wait_until(|| fallback.subscription_count("adv") == 1).await;
    fallback.publish("adv", b"moved");
    let message = timeout(WAIT, subscriber.next()).await?.expect("message");
    assert_eq!(message.payload.as_ref(), b"moved");

    connection.dispose().await;
    fallback.shutdown().await;
    Ok(())
}
