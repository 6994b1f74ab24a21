//! In-process mock NATS server.
//!
//! # Purpose
//! Speaks enough of the server side of the protocol to exercise the client
//! engine end to end: INFO on accept, CONNECT/PING/PONG, SUB/UNSUB
//! accounting, and PUB routing (with `*`/`>` wildcard matching and queue
//! groups) back to matching subscriptions.
//!
//! # Notes
//! This is test tooling; it favors observability (counters, SUB accounting)
//! over throughput.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Behavior knobs for a [`MockServer`].
#[derive(Debug, Clone, Default)]
pub struct MockServerOptions {
    /// Answer only the first PING of each connection (the handshake one);
    /// later keepalive PINGs go unanswered to drive the client's watchdog.
    pub silent_pings: bool,
    /// Reject CONNECT unless it carries this token, with an authorization
    /// error.
    pub required_token: Option<String>,
    /// Advertised in INFO `connect_urls`.
    pub advertised_urls: Vec<String>,
}

#[derive(Debug)]
struct SubRecord {
    conn_id: u64,
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    sink: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    subscriptions: Mutex<Vec<SubRecord>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    connects: AtomicUsize,
    pings: AtomicUsize,
    next_conn_id: AtomicU64,
    stopped: AtomicBool,
}

/// One in-process server bound to a local port.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    options: MockServerOptions,
    accept_task: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Bind an ephemeral local port with default options.
    pub async fn start() -> Result<Self> {
        Self::bind("127.0.0.1:0", MockServerOptions::default()).await
    }

    pub async fn start_with(options: MockServerOptions) -> Result<Self> {
        Self::bind("127.0.0.1:0", options).await
    }

    /// Bind a specific address; used to restart a server on a known port.
    pub async fn bind(addr: &str, options: MockServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind mock server")?;
        let addr = listener.local_addr().context("local addr")?;
        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        let accept_options = options.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if accept_state.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let state = Arc::clone(&accept_state);
                let options = accept_options.clone();
                let task_state = Arc::clone(&accept_state);
                let task = tokio::spawn(async move {
                    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
                    if let Err(err) = serve_connection(stream, state.clone(), options, conn_id).await
                    {
                        tracing::debug!(error = %err, conn_id, "mock connection ended");
                    }
                    state
                        .subscriptions
                        .lock()
                        .expect("subscriptions lock poisoned")
                        .retain(|record| record.conn_id != conn_id);
                });
                task_state
                    .conn_tasks
                    .lock()
                    .expect("conn tasks lock poisoned")
                    .push(task);
            }
        });
        Ok(Self {
            addr,
            state,
            options,
            accept_task: Some(accept_task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Clients that completed a CONNECT so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// PINGs received, answered or not.
    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Active SUB accounting for one literal subject.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.state
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .iter()
            .filter(|record| record.subject == subject)
            .count()
    }

    /// Route a payload to matching subscriptions, as if published by a
    /// sidecar client.
    pub fn publish(&self, subject: &str, payload: &[u8]) {
        route_publish(&self.state, subject, None, payload);
    }

    /// Stop accepting and drop every live connection; clients observe a
    /// socket close.
    pub async fn shutdown(mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        let tasks = std::mem::take(
            &mut *self
                .state
                .conn_tasks
                .lock()
                .expect("conn tasks lock poisoned"),
        );
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.state
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clear();
        let _ = self.options;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    options: MockServerOptions,
    conn_id: u64,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let info = serde_json::json!({
        "server_id": format!("MOCK{conn_id}"),
        "server_name": "tern-mock",
        "version": "2.10.0",
        "proto": 1,
        "headers": true,
        "max_payload": 1048576,
        "connect_urls": options.advertised_urls,
    });
    write_half
        .write_all(format!("INFO {info}\r\n").as_bytes())
        .await
        .context("write INFO")?;

    // Outbound frames are serialized through one writer task per connection.
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = sink_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = serve_ops(&mut reader, &sink_tx, &state, &options, conn_id).await;
    drop(sink_tx);
    let _ = writer.await;
    result
}

async fn serve_ops(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    sink: &mpsc::UnboundedSender<Vec<u8>>,
    state: &Arc<ServerState>,
    options: &MockServerOptions,
    conn_id: u64,
) -> Result<()> {
    let mut pings_on_this_conn = 0usize;
    loop {
        let line = read_control_line(reader).await?;
        let Some(line) = line else {
            return Ok(());
        };
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line.as_str(), ""),
        };
        match verb.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                if let Some(required) = &options.required_token {
                    let value: serde_json::Value =
                        serde_json::from_str(rest).context("parse CONNECT json")?;
                    if value.get("auth_token").and_then(|token| token.as_str())
                        != Some(required.as_str())
                    {
                        let _ = sink.send(b"-ERR 'Authorization Violation'\r\n".to_vec());
                        return Ok(());
                    }
                }
                state.connects.fetch_add(1, Ordering::SeqCst);
            }
            "PING" => {
                state.pings.fetch_add(1, Ordering::SeqCst);
                pings_on_this_conn += 1;
                if !options.silent_pings || pings_on_this_conn == 1 {
                    let _ = sink.send(b"PONG\r\n".to_vec());
                }
            }
            "PONG" => {}
            "SUB" => {
                let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, queue_group, sid) = match fields.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, group, sid] => (*subject, Some(group.to_string()), *sid),
                    _ => bail!("malformed SUB: {rest}"),
                };
                let sid: u64 = sid.parse().context("parse sid")?;
                let mut subscriptions = state
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned");
                // Re-SUB with the same sid replaces the binding.
                subscriptions.retain(|record| !(record.conn_id == conn_id && record.sid == sid));
                subscriptions.push(SubRecord {
                        conn_id,
                        sid,
                        subject: subject.to_string(),
                        queue_group,
                        sink: sink.clone(),
                    });
            }

            "UNSUB" => {
                let sid: u64 = rest
                    .split_ascii_whitespace()
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .context("parse UNSUB sid")?;
                state
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .retain(|record| !(record.conn_id == conn_id && record.sid == sid));
            }
            "PUB" => {
                let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, reply_to, length) = match fields.as_slice() {
                    [subject, length] => (*subject, None, *length),
                    [subject, reply, length] => (*subject, Some(*reply), *length),
                    _ => bail!("malformed PUB: {rest}"),
                };
                let length: usize = length.parse().context("parse PUB length")?;
                let payload = read_payload(reader, length).await?;
                route_publish(state, subject, reply_to, &payload);
            }
            "HPUB" => {
                let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
                let (subject, reply_to, total) = match fields.as_slice() {
                    [subject, _hdr, total] => (*subject, None, *total),
                    [subject, reply, _hdr, total] => (*subject, Some(*reply), *total),
                    _ => bail!("malformed HPUB: {rest}"),
                };
                let total: usize = total.parse().context("parse HPUB length")?;
                // Headers are passed through verbatim with the payload.
                let payload = read_payload(reader, total).await?;
                route_publish(state, subject, reply_to, &payload);
            }
            other => bail!("unsupported client op: {other}"),
        }
    }
}

async fn read_control_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => return Err(err).context("read control line"),
        };
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(String::from_utf8(line).context("control line utf8")?));
        }
        line.push(byte);
        if line.len() > 1024 * 1024 {
            bail!("control line too long");
        }
    }
}

async fn read_payload(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    length: usize,
) -> Result<Bytes> {
    let mut payload = vec![0u8; length + 2];
    reader
        .read_exact(&mut payload)
        .await
        .context("read payload")?;
    if &payload[length..] != b"\r\n" {
        bail!("payload missing CRLF terminator");
    }
    payload.truncate(length);
    Ok(Bytes::from(payload))
}

fn route_publish(state: &Arc<ServerState>, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
    let subscriptions = state
        .subscriptions
        .lock()
        .expect("subscriptions lock poisoned");
    // Queue groups deliver to a single member; plain subscriptions fan out.
    let mut chosen_groups: HashMap<&str, &SubRecord> = HashMap::new();
    let mut plain: Vec<&SubRecord> = Vec::new();
    for record in subscriptions.iter() {
        if !subject_matches(&record.subject, subject) {
            continue;
        }
        match &record.queue_group {
            Some(group) => {
                chosen_groups.entry(group.as_str()).or_insert(record);
            }
            None => plain.push(record),
        }
    }
    for record in plain.into_iter().chain(chosen_groups.into_values()) {
        let mut frame = Vec::with_capacity(payload.len() + 64);
        match reply_to {
            Some(reply) => frame.extend_from_slice(
                format!("MSG {subject} {} {reply} {}\r\n", record.sid, payload.len()).as_bytes(),
            ),
            None => frame.extend_from_slice(
                format!("MSG {subject} {} {}\r\n", record.sid, payload.len()).as_bytes(),
            ),
        }
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        let _ = record.sink.send(frame);
    }
}

/// NATS subject matching: `*` matches one token, `>` matches the rest.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(token), Some(actual)) if token == actual => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_matching_tokens_and_wildcards() {
        assert!(subject_matches("a.b", "a.b"));
        assert!(!subject_matches("a.b", "a.c"));
        assert!(subject_matches("a.*", "a.b"));
        assert!(!subject_matches("a.*", "a.b.c"));
        assert!(subject_matches("a.>", "a.b.c"));
        assert!(subject_matches(">", "anything.at.all"));
        assert!(!subject_matches("a.b.c", "a.b"));
    }

    #[tokio::test]
    async fn raw_client_can_subscribe_and_receive() -> Result<()> {
        let server = MockServer::start().await?;
        let mut stream = TcpStream::connect(server.addr()).await?;
        let mut greeting = vec![0u8; 1024];
        let n = stream.read(&mut greeting).await?;
        assert!(greeting[..n].starts_with(b"INFO "));

        stream
            .write_all(b"CONNECT {}\r\nSUB updates 1\r\nPUB updates 5\r\nhello\r\n")
            .await?;
        let mut frame = Vec::new();
        while !frame.ends_with(b"hello\r\n") {
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).await?;
            assert!(n > 0, "server closed early");
            frame.extend_from_slice(&chunk[..n]);
        }
        assert!(frame.starts_with(b"MSG updates 1 5\r\n"));
        assert_eq!(server.subscription_count("updates"), 1);
        server.shutdown().await;
        Ok(())
    }
}
