//! Connection state machine.
//!
//! # Purpose
//! Owns the socket and the reader/writer/ping tasks, drives the handshake,
//! and reconnects with subscription replay when the socket dies. The command
//! queue and both registries outlive any one socket.
//!
//! # Design notes
//! Why one long-lived supervisor task?
//! - Respawning a supervisor per socket grows a call chain across reconnect
//!   cycles; a loop in a single task cannot.
//! - The supervisor is the only place that performs the Open → Reconnecting
//!   transition, so the teardown order is in one function, not scattered.
//!
//! Teardown asymmetry: the outgoing reader's state is private to it, so it
//! winds down detached; the writer owns the buffer and queue the next writer
//! needs, so it is awaited synchronously before a new socket is dialed.
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use bytes::Bytes;
use tern_wire::{HeaderMap, ServerInfo};

use crate::client::ping::{PingTracker, run_ping_timer};
use crate::client::reader::{HandshakeSignals, ReaderShared, run_reader_loop};
use crate::client::requests::{RequestGuard, RequestRegistry};
use crate::client::subscriptions::{
    Message, MessageHandler, RequestHandler, SubscriptionHandle, SubscriptionRegistry, Subscriber,
};
use crate::client::writer::{WriterState, run_writer_loop};
use crate::commands::{Command, Completion, PublishItem};
use crate::config::{ConnectOptions, ServerAddr};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::socket::{self, CloseSignal};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// One message of a batch publish.
#[derive(Debug, Clone)]
pub struct PublishMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

// Single-shot "wait for open" completion. Replaced wholesale after each
// terminal outcome so later connect() calls start a fresh attempt.
struct OpenSignal {
    tx: watch::Sender<Option<Result<()>>>,
}

impl OpenSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    fn complete(&self, result: Result<()>) {
        // First completion wins; replacements, not re-completions, reset it.
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(Error::Disposed);
            }
        }
    }
}

// Handles for the tasks bound to the current socket.
struct LiveIo {
    closed: CloseSignal,
    reader: JoinHandle<()>,
    writer: JoinHandle<WriterState>,
    ping: JoinHandle<()>,
}

struct ConnState {
    phase: State,
    wait_open: Arc<OpenSignal>,
    // Parked whenever no writer task is running. Invariant: exactly one of
    // `writer` / a live writer task holds the WriterState at any time.
    writer: Option<WriterState>,
    live: Option<LiveIo>,
    current: Option<ServerAddr>,
    supervisor_started: bool,
}

struct ConnectionInner {
    options: ConnectOptions,
    state: Mutex<ConnState>,
    subs: Arc<SubscriptionRegistry>,
    requests: Arc<RequestRegistry>,
    pings: Arc<PingTracker>,
    pool: Arc<BufferPool>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    server_info: Arc<Mutex<Option<ServerInfo>>>,
    disposed: AtomicBool,
    request_sub_installed: AtomicBool,
}

/// A single long-lived session to one NATS server at a time.
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(options: ConnectOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let writer = WriterState::new(cmd_rx, options.max_payload, options.flush_watermark);
        let requests = RequestRegistry::new(&options.inbox_prefix);
        let pool = BufferPool::new(options.command_pool_size);
        Self {
            inner: Arc::new(ConnectionInner {
                state: Mutex::new(ConnState {
                    phase: State::Closed,
                    wait_open: Arc::new(OpenSignal::new()),
                    writer: Some(writer),
                    live: None,
                    current: None,
                    supervisor_started: false,
                }),
                subs: SubscriptionRegistry::new(),
                requests,
                pings: PingTracker::new(),
                pool,
                cmd_tx,
                server_info: Arc::new(Mutex::new(None)),
                disposed: AtomicBool::new(false),
                request_sub_installed: AtomicBool::new(false),
                options,
            }),
        }
    }

    /// Parse a seed URL list and build a closed connection.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(ConnectOptions::from_url(url)?))
    }

    pub fn state(&self) -> State {
        self.inner.state.lock().expect("state lock poisoned").phase
    }

    /// Most recent INFO from the current or last server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner
            .server_info
            .lock()
            .expect("server info lock poisoned")
            .clone()
    }

    /// Establish the session. Idempotent: concurrent callers share one
    /// attempt and observe the same outcome.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Connect("connection is disposed".to_string()));
        }
        enum Action {
            Wait(Arc<OpenSignal>),
            Drive,
        }
        let action = {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            match state.phase {
                State::Open => return Ok(()),
                State::Connecting | State::Reconnecting => Action::Wait(state.wait_open.clone()),
                State::Closed => {
                    state.phase = State::Connecting;
                    Action::Drive
                }
            }
        };
        match action {
            Action::Wait(signal) => signal.wait().await,
            Action::Drive => self.drive_initial_connect().await,
        }
    }

    async fn drive_initial_connect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut candidates = inner.options.servers.clone();
        if !inner.options.no_randomize {
            candidates.shuffle(&mut rand::rng());
        }
        let mut last_error: Option<Error> = None;
        for addr in &candidates {
            match attempt_handshake(inner, addr, None).await {
                Ok(live) => {
                    let (signal, supervisor_needed) = {
                        let mut state = inner.state.lock().expect("state lock poisoned");
                        if inner.disposed.load(Ordering::SeqCst) {
                            // Disposed while the handshake was in flight.
                            live.closed.trip();
                            live.ping.abort();
                            return Err(Error::Connect("connection is disposed".to_string()));
                        }
                        state.phase = State::Open;
                        state.current = Some(addr.clone());
                        state.live = Some(live);
                        let needed = !state.supervisor_started;
                        state.supervisor_started = true;
                        (state.wait_open.clone(), needed)
                    };
                    signal.complete(Ok(()));
                    if supervisor_needed {
                        tokio::spawn(run_supervisor(Arc::clone(inner)));
                    }
                    metrics::counter!("tern_client_connects_total").increment(1);
                    tracing::debug!(server = %addr, "connected");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(server = %addr, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        let failure = Error::Connect(match last_error {
            Some(err) => err.to_string(),
            None => "no seed servers configured".to_string(),
        });
        // Back to Closed; the failed signal is replaced so a later connect()
        // can retry while earlier waiters still observe this failure.
        let signal = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.phase = State::Closed;
            std::mem::replace(&mut state.wait_open, Arc::new(OpenSignal::new()))
        };
        signal.complete(Err(failure.clone()));
        Err(failure)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        self.inner
            .cmd_tx
            .send(command)
            .map_err(|_| Error::Disposed)
    }

    fn publish_command(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<HeaderMap>,
        payload: &[u8],
        done: Option<Completion>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.enqueue(Command::Publish {
            item: PublishItem {
                subject: subject.to_string(),
                reply_to: reply_to.map(String::from),
                headers,
                payload: self.inner.pool.rent(payload),
            },
            done,
        })
    }

    /// Fire-and-forget publish; bytes reach the socket in enqueue order.
    pub fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.publish_command(subject, None, None, payload, None)
    }

    pub fn publish_with_reply(&self, subject: &str, reply_to: &str, payload: &[u8]) -> Result<()> {
        self.publish_command(subject, Some(reply_to), None, payload, None)
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: &[u8],
    ) -> Result<()> {
        self.publish_command(subject, None, Some(headers), payload, None)
    }

    /// Publish and wait until the bytes have been handed to the socket.
    pub async fn publish_wait(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.publish_command(subject, None, None, payload, Some(tx))?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Many publishes in a single write.
    pub fn publish_batch(&self, messages: Vec<PublishMessage>) -> Result<()> {
        self.ensure_live()?;
        self.enqueue(Command::PublishBatch {
            items: self.batch_items(messages),
            done: None,
        })
    }

    pub async fn publish_batch_wait(&self, messages: Vec<PublishMessage>) -> Result<()> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Command::PublishBatch {
            items: self.batch_items(messages),
            done: Some(tx),
        })?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    fn batch_items(&self, messages: Vec<PublishMessage>) -> Vec<PublishItem> {
        messages
            .into_iter()
            .map(|message| PublishItem {
                subject: message.subject,
                reply_to: message.reply_to,
                headers: message.headers,
                payload: self.inner.pool.rent(&message.payload),
            })
            .collect()
    }

    /// Pull-style subscription; dropping the handle unsubscribes.
    pub fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        self.subscribe_inner(subject, None)
    }

    /// Queue-group subscription: the server delivers each message to one
    /// member of the group.
    pub fn subscribe_queue(&self, subject: &str, queue_group: &str) -> Result<Subscriber> {
        self.subscribe_inner(subject, Some(queue_group))
    }

    fn subscribe_inner(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscriber> {
        self.ensure_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        let sid = self.register_subscription(subject, queue_group, handler)?;
        Ok(Subscriber {
            sid,
            subject: subject.to_string(),
            rx,
            registry: Arc::clone(&self.inner.subs),
            cmd_tx: self.inner.cmd_tx.clone(),
        })
    }

    /// Callback-style subscription; the handler runs on the reader task, so
    /// it must not block.
    pub fn subscribe_with_handler(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        self.ensure_live()?;
        let sid = self.register_subscription(subject, queue_group, Arc::new(handler))?;
        Ok(SubscriptionHandle {
            sid,
            registry: Arc::clone(&self.inner.subs),
            cmd_tx: self.inner.cmd_tx.clone(),
        })
    }

    fn register_subscription(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        handler: MessageHandler,
    ) -> Result<u64> {
        // Register before SUB goes out so an inbound MSG can never race the
        // registry entry.
        let sid = self
            .inner
            .subs
            .add(subject.to_string(), queue_group.map(String::from), handler);
        self.enqueue(Command::Subscribe {
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(String::from),
            done: None,
        })?;
        Ok(sid)
    }

    /// Serve requests on `subject`: decode, handle, publish the reply to the
    /// request's reply-to.
    pub fn subscribe_request(
        &self,
        subject: &str,
        handler: impl Fn(Message) -> Result<Bytes> + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        self.ensure_live()?;
        let handler: RequestHandler = Arc::new(handler);
        let sid = self.inner.subs.add_responder(subject.to_string(), handler);
        self.enqueue(Command::Subscribe {
            sid,
            subject: subject.to_string(),
            queue_group: None,
            done: None,
        })?;
        Ok(SubscriptionHandle {
            sid,
            registry: Arc::clone(&self.inner.subs),
            cmd_tx: self.inner.cmd_tx.clone(),
        })
    }

    /// Request/response over a per-call inbox. Timeouts are the caller's
    /// concern: wrap in `tokio::time::timeout`; dropping the future cancels
    /// the waiter.
    pub async fn request(&self, subject: &str, payload: &[u8]) -> Result<Message> {
        self.ensure_live()?;
        self.ensure_request_subscription()?;
        let (id, reply_subject, rx) = self.inner.requests.register();
        let _guard = RequestGuard {
            registry: Arc::clone(&self.inner.requests),
            id,
        };
        self.publish_command(subject, Some(&reply_subject), None, payload, None)?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    fn ensure_request_subscription(&self) -> Result<()> {
        if self.inner.request_sub_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let requests = Arc::clone(&self.inner.requests);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            let subject = message.subject.clone();
            if !requests.dispatch_subject(&subject, message) {
                tracing::debug!(subject = %subject, "inbox message without a waiter");
            }
        });
        let subject = self.inner.requests.wildcard_subject();
        let sid = self.inner.subs.add(subject.clone(), None, handler);
        self.enqueue(Command::Subscribe {
            sid,
            subject,
            queue_group: None,
            done: None,
        })
    }

    /// Round-trip to the server; resolves with the measured RTT.
    pub async fn ping(&self) -> Result<Duration> {
        self.ensure_live()?;
        let rx = self.inner.pings.register_rtt();
        self.enqueue(Command::Ping { done: None })?;
        rx.await.map_err(|_| Error::ConnectionLost)
    }

    /// Escape hatch: raw protocol bytes, written `repeat` times in order
    /// with everything else in the queue.
    pub fn direct_write(&self, bytes: Bytes, repeat: usize) -> Result<()> {
        self.ensure_live()?;
        self.enqueue(Command::DirectWrite {
            bytes,
            repeat,
            done: None,
        })
    }

    pub async fn direct_write_wait(&self, bytes: Bytes, repeat: usize) -> Result<()> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Command::DirectWrite {
            bytes,
            repeat,
            done: Some(tx),
        })?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Graceful shutdown: drain the writer within a bounded window, close
    /// the socket, let the reader drain, fail everything pending.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (live, signal) = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.phase = State::Closed;
            let signal = std::mem::replace(&mut state.wait_open, Arc::new(OpenSignal::new()));
            (state.live.take(), signal)
        };
        signal.complete(Err(Error::Disposed));
        if let Some(live) = live {
            live.ping.abort();
            live.closed.trip();
            match tokio::time::timeout(inner.options.drain_timeout, live.writer).await {
                Ok(Ok(writer_state)) => {
                    inner.state.lock().expect("state lock poisoned").writer = Some(writer_state);
                }
                Ok(Err(_)) | Err(_) => {}
            }
            let _ = tokio::time::timeout(inner.options.drain_timeout, live.reader).await;
        }
        inner.requests.reset(Error::Disposed);
        inner.pings.reset();
        inner.subs.clear();
        tracing::debug!("connection disposed");
    }
}

/// Dial `addr`, start the loops, and run the handshake. On success the ping
/// timer is running and the returned handles are live; on failure everything
/// is torn down and the writer state is parked again.
async fn attempt_handshake(
    inner: &Arc<ConnectionInner>,
    addr: &ServerAddr,
    replay: Option<Vec<crate::commands::ReplayEntry>>,
) -> Result<LiveIo> {
    let stream = socket::connect(addr, &inner.options.tls, inner.options.connect_timeout).await?;
    let is_tls = stream.is_tls();
    let (read_half, write_half) = tokio::io::split(stream);

    let closed = CloseSignal::new();
    let (info_tx, info_rx) = oneshot::channel();
    let (pong_tx, pong_rx) = oneshot::channel();
    let writer_state = inner
        .state
        .lock()
        .expect("state lock poisoned")
        .writer
        .take()
        .expect("writer state parked while a writer task is live");
    let (priority_tx, priority_rx) = oneshot::channel();

    let reader = tokio::spawn(run_reader_loop(
        read_half,
        ReaderShared {
            subs: Arc::clone(&inner.subs),
            pings: Arc::clone(&inner.pings),
            cmd_tx: inner.cmd_tx.clone(),
            server_info: Arc::clone(&inner.server_info),
        },
        HandshakeSignals {
            info_tx: Some(info_tx),
            pong_tx: Some(pong_tx),
        },
        closed.clone(),
        inner.options.max_payload,
    ));
    let writer = tokio::spawn(run_writer_loop(
        writer_state,
        write_half,
        priority_rx,
        closed.clone(),
    ));

    match drive_handshake(inner, is_tls, info_rx, pong_rx, priority_tx, replay).await {
        Ok(()) => {
            let ping = tokio::spawn(run_ping_timer(
                inner.options.ping_interval,
                inner.options.max_pings_out,
                inner.cmd_tx.clone(),
                Arc::clone(&inner.pings),
                closed.clone(),
            ));
            Ok(LiveIo {
                closed,
                reader,
                writer,
                ping,
            })
        }
        Err(err) => {
            closed.trip();
            // Reader winds down detached; its state is not shared.
            drop(reader);
            let writer_state = writer.await.expect("writer task panicked");
            inner.state.lock().expect("state lock poisoned").writer = Some(writer_state);
            Err(err)
        }
    }
}

/// The handshake proper, §-ordered: info, priority lane, CONNECT flushed,
/// PONG (or -ERR), replay flushed.
async fn drive_handshake(
    inner: &Arc<ConnectionInner>,
    is_tls: bool,
    info_rx: oneshot::Receiver<ServerInfo>,
    pong_rx: oneshot::Receiver<Result<()>>,
    priority_tx: oneshot::Sender<Vec<Command>>,
    replay: Option<Vec<crate::commands::ReplayEntry>>,
) -> Result<()> {
    let deadline = inner.options.connect_timeout;

    let info = tokio::time::timeout(deadline, info_rx)
        .await
        .map_err(|_| Error::Handshake("timed out waiting for server info".to_string()))?
        .map_err(|_| Error::Handshake("connection closed before server info".to_string()))?;
    if info.tls_required && !is_tls {
        return Err(Error::Handshake(
            "server requires TLS; configure a tls:// url or TlsMode::Require".to_string(),
        ));
    }

    let (connect_done_tx, connect_done_rx) = oneshot::channel();
    let mut lane = vec![
        Command::Connect {
            info: Box::new(inner.options.connect_info()),
            done: Some(connect_done_tx),
        },
        Command::Ping { done: None },
    ];
    let mut replay_rx = None;
    if let Some(entries) = replay
        && !entries.is_empty()
    {
        let (tx, rx) = oneshot::channel();
        lane.push(Command::SubscribeBatch {
            entries,
            done: Some(tx),
        });
        replay_rx = Some(rx);
    }
    priority_tx
        .send(lane)
        .map_err(|_| Error::Handshake("writer exited before the handshake".to_string()))?;

    tokio::time::timeout(deadline, connect_done_rx)
        .await
        .map_err(|_| Error::Handshake("timed out flushing CONNECT".to_string()))?
        .map_err(|_| Error::Handshake("writer dropped the CONNECT completion".to_string()))?
        .map_err(|err| Error::Handshake(format!("CONNECT write failed: {err}")))?;

    match tokio::time::timeout(deadline, pong_rx)
        .await
        .map_err(|_| Error::Handshake("timed out waiting for the initial PONG".to_string()))?
        .map_err(|_| Error::Handshake("connection closed before the initial PONG".to_string()))?
    {
        Ok(()) => {}
        // Auth keeps its kind; everything else is a handshake failure.
        Err(err @ Error::Auth(_)) => return Err(err),
        Err(err) => return Err(Error::Handshake(err.to_string())),
    }

    if let Some(rx) = replay_rx {
        tokio::time::timeout(deadline, rx)
            .await
            .map_err(|_| Error::Handshake("timed out flushing subscription replay".to_string()))?
            .map_err(|_| Error::Handshake("writer dropped the replay completion".to_string()))?
            .map_err(|err| Error::Handshake(format!("subscription replay failed: {err}")))?;
    }
    Ok(())
}

/// Candidate order for a reconnect round: advertised URLs from the latest
/// INFO (falling back to seeds), de-duplicated, shuffled unless pinned, with
/// the previous server moved to the end.
fn reconnect_candidates(
    inner: &ConnectionInner,
    previous: Option<&ServerAddr>,
) -> Vec<ServerAddr> {
    let tls_hint = previous
        .map(|addr| addr.tls)
        .or_else(|| inner.options.servers.first().map(|addr| addr.tls))
        .unwrap_or(false);
    let advertised: Vec<ServerAddr> = inner
        .server_info
        .lock()
        .expect("server info lock poisoned")
        .as_ref()
        .map(|info| {
            info.connect_urls
                .iter()
                .filter_map(|entry| ServerAddr::from_host_port(entry, tls_hint).ok())
                .collect()
        })
        .unwrap_or_default();
    let mut candidates = if advertised.is_empty() {
        inner.options.servers.clone()
    } else {
        advertised
    };
    let mut seen = HashSet::new();
    candidates.retain(|addr| seen.insert(addr.clone()));
    if !inner.options.no_randomize {
        candidates.shuffle(&mut rand::rng());
    }
    if let Some(previous) = previous
        && let Some(position) = candidates.iter().position(|addr| addr == previous)
    {
        let addr = candidates.remove(position);
        candidates.push(addr);
    }
    candidates
}

/// Long-lived reconnect supervisor: waits for the current socket to die,
/// performs the Open → Reconnecting transition, then dials candidates until
/// a handshake (with replay) succeeds.
async fn run_supervisor(inner: Arc<ConnectionInner>) {
    loop {
        let closed = {
            let state = inner.state.lock().expect("state lock poisoned");
            match &state.live {
                Some(live) => live.closed.clone(),
                None => return,
            }
        };
        closed.tripped().await;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        metrics::counter!("tern_client_connection_lost_total").increment(1);
        tracing::info!("connection lost; reconnecting");

        // Open → Reconnecting, all under the state lock.
        let live = {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.phase = State::Reconnecting;
            let old_signal =
                std::mem::replace(&mut state.wait_open, Arc::new(OpenSignal::new()));
            old_signal.complete(Err(Error::ConnectionLost));
            state.live.take()
        };
        let Some(live) = live else { return };
        live.ping.abort();
        inner.requests.reset(Error::ConnectionLost);
        inner.pings.reset();
        // Reader teardown is fire-and-forget; writer teardown is not.
        drop(live.reader);
        let writer_state = live.writer.await.expect("writer task panicked");
        inner.state.lock().expect("state lock poisoned").writer = Some(writer_state);

        let previous = inner
            .state
            .lock()
            .expect("state lock poisoned")
            .current
            .clone();
        'rounds: loop {
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            for addr in reconnect_candidates(&inner, previous.as_ref()) {
                if inner.disposed.load(Ordering::SeqCst) {
                    return;
                }
                let replay = inner.subs.replay_entries();
                match attempt_handshake(&inner, &addr, Some(replay)).await {
                    Ok(live) => {
                        let signal = {
                            let mut state = inner.state.lock().expect("state lock poisoned");
                            if inner.disposed.load(Ordering::SeqCst) {
                                live.closed.trip();
                                live.ping.abort();
                                return;
                            }
                            state.phase = State::Open;
                            state.current = Some(addr.clone());
                            state.live = Some(live);
                            state.wait_open.clone()
                        };
                        signal.complete(Ok(()));
                        metrics::counter!("tern_client_reconnects_total").increment(1);
                        tracing::info!(server = %addr, "reconnected");
                        break 'rounds;
                    }
                    Err(err) => {
                        tracing::warn!(server = %addr, error = %err, "reconnect attempt failed");
                    }
                }
            }
            // Round exhausted: jittered backoff, then rebuild the iterator.
            let jitter = inner
                .options
                .reconnect_jitter
                .mul_f64(rand::random::<f64>());
            tokio::time::sleep(inner.options.reconnect_wait + jitter).await;
        }
    }
}
