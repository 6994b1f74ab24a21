// Request/response over per-call inboxes.
use anyhow::Result;
use std::time::Duration;
use tern_client::{ConnectOptions, Connection, Error};
use test_harness::MockServer;
use tokio::time::timeout;

fn options_for(server: &MockServer) -> ConnectOptions {
    let mut options =
        ConnectOptions::defaults(vec![server.url().parse().expect("server url")]);
    options.connect_timeout = Duration::from_secs(2);
    options.reconnect_wait = Duration::from_millis(50);
    options.reconnect_jitter = Duration::from_millis(20);
    options
}

#[tokio::test]
async fn request_reply_round_trips_within_a_second() -> Result<()> {
    let server = MockServer::start().await?;
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let _responder = connection.subscribe_request("svc", |request| Ok(request.payload))?;
    let response = timeout(Duration::from_secs(1), connection.request("svc", b"ping"))
        .await?
        .expect("response");
    assert_eq!(response.payload.as_ref(), b"ping");

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_route_to_their_own_waiters() -> Result<()> {
    let server = MockServer::start().await?;
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let _responder = connection.subscribe_request("echo", |request| Ok(request.payload))?;
    let mut tasks = Vec::new();
    for index in 0..32u32 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            let payload = index.to_string();
            let response = connection.request("echo", payload.as_bytes()).await?;
            assert_eq!(response.payload.as_ref(), payload.as_bytes());
            Ok::<_, Error>(())
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await?
            .expect("join")
            .expect("request");
    }

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timed_out_request_is_cancelled_and_forgotten() -> Result<()> {
    let server = MockServer::start().await?;
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    // Nobody serves "void", so the request can only time out.
    let result = timeout(Duration::from_millis(200), connection.request("void", b"?")).await;
    assert!(result.is_err(), "request should not have resolved");

    // The connection keeps working after the cancellation.
    let _responder = connection.subscribe_request("svc", |request| Ok(request.payload))?;
    let response = timeout(Duration::from_secs(1), connection.request("svc", b"ok"))
        .await?
        .expect("response");
    assert_eq!(response.payload.as_ref(), b"ok");

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn pending_requests_fail_with_connection_lost_when_the_socket_dies() -> Result<()> {
    let server = MockServer::start().await?;
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("nobody.home", b"?").await })
    };
    // Let the request reach the wire, then kill the server.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.shutdown().await;

    let outcome = timeout(Duration::from_secs(5), pending).await?.expect("join");
    assert_eq!(outcome.expect_err("request must fail"), Error::ConnectionLost);

    connection.dispose().await;
    Ok(())
}

#[tokio::test]
async fn responder_errors_do_not_kill_the_connection() -> Result<()> {
    let server = MockServer::start().await?;
    let connection = Connection::new(options_for(&server));
    connection.connect().await?;

    let _responder = connection.subscribe_request("flaky", |request| {
        if request.payload.as_ref() == b"bad" {
            Err(Error::Protocol("unparseable request".to_string()))
        } else {
            Ok(request.payload)
        }
    })?;

    // The failing request gets no reply; it times out on the caller side.
    let result = timeout(Duration::from_millis(200), connection.request("flaky", b"bad")).await;
    assert!(result.is_err());

    // A good request on the same responder still round-trips.
    let response = timeout(Duration::from_secs(1), connection.request("flaky", b"good"))
        .await?
        .expect("response");
    assert_eq!(response.payload.as_ref(), b"good");

    connection.dispose().await;
    server.shutdown().await;
    Ok(())
}
