//! Pipelining writer loop.
//!
//! # Purpose
//! The single consumer of the command queue. Serializes commands into one
//! shared buffer, flushes in batches, and fires completions only after the
//! flush that carried their bytes succeeds.
//!
//! # Design notes
//! The loop starts gated on the priority lane: nothing leaves the queue
//! until the handshake driver delivers CONNECT/PING (and the SUB replay on
//! reconnect), so priority commands always precede queued commands on a new
//! socket. The buffer and queue receiver live in [`WriterState`], which the
//! loop returns on exit so the next socket's writer picks up exactly where
//! this one stopped.
use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::commands::{Command, Completion};
use crate::error::Error;
use crate::socket::{CloseSignal, SocketStream};

/// Everything that persists across reconnects: the queue's consumer end and
/// the serialization buffer.
pub(crate) struct WriterState {
    pub(crate) rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) buf: BytesMut,
    pub(crate) max_payload: usize,
    pub(crate) flush_watermark: usize,
}

impl WriterState {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Command>,
        max_payload: usize,
        flush_watermark: usize,
    ) -> Self {
        Self {
            rx,
            buf: BytesMut::with_capacity(flush_watermark),
            max_payload,
            flush_watermark,
        }
    }
}

pub(crate) async fn run_writer_loop(
    mut state: WriterState,
    mut sink: WriteHalf<SocketStream>,
    priority_rx: oneshot::Receiver<Vec<Command>>,
    closed: CloseSignal,
) -> WriterState {
    // Completions for commands serialized into the current batch.
    let mut pending: Vec<Completion> = Vec::new();

    let lane = tokio::select! {
        _ = closed.tripped() => None,
        lane = priority_rx => lane.ok(),
    };
    let Some(lane) = lane else {
        // Handshake abandoned before delivering the lane.
        return state;
    };
    for command in lane {
        serialize_command(command, &mut state, &mut pending);
    }
    if !flush(&mut sink, &mut state, &mut pending, &closed).await {
        return state;
    }

    loop {
        tokio::select! {
            _ = closed.tripped() => {
                drain_on_close(&mut state, &mut pending);
                let _ = flush(&mut sink, &mut state, &mut pending, &closed).await;
                let _ = sink.shutdown().await;
                return state;
            }
            command = state.rx.recv() => {
                let Some(command) = command else {
                    // Every producer handle is gone; the connection is gone.
                    let _ = sink.shutdown().await;
                    return state;
                };
                serialize_command(command, &mut state, &mut pending);
                // Batch whatever else is already queued, up to the watermark.
                while state.buf.len() < state.flush_watermark {
                    match state.rx.try_recv() {
                        Ok(command) => serialize_command(command, &mut state, &mut pending),
                        Err(_) => break,
                    }
                }
                if !flush(&mut sink, &mut state, &mut pending, &closed).await {
                    return state;
                }
            }
        }
    }
}

fn serialize_command(mut command: Command, state: &mut WriterState, pending: &mut Vec<Completion>) {
    let done = command.take_done();
    match command.serialize(&mut state.buf, state.max_payload) {
        Ok(()) => {
            if let Some(done) = done {
                pending.push(done);
            }
        }
        // One bad command never poisons the batch.
        Err(err) => {
            tracing::debug!(error = %err, "command failed to serialize");
            if let Some(done) = done {
                let _ = done.send(Err(err));
            }
        }
    }
}

/// Bounded drain after a close/dispose: serialize what is already queued so
/// its bytes can ride the final flush, but never wait for new producers.
fn drain_on_close(state: &mut WriterState, pending: &mut Vec<Completion>) {
    while state.buf.len() < state.flush_watermark {
        match state.rx.try_recv() {
            Ok(command) => serialize_command(command, state, pending),
            Err(_) => break,
        }
    }
}

/// Write the batch out. On failure every completion in the batch observes
/// `WriteFailed` and the closed-signal trips; returns whether to continue.
async fn flush(
    sink: &mut WriteHalf<SocketStream>,
    state: &mut WriterState,
    pending: &mut Vec<Completion>,
    closed: &CloseSignal,
) -> bool {
    if state.buf.is_empty() {
        for done in pending.drain(..) {
            let _ = done.send(Ok(()));
        }
        return true;
    }
    let result = async {
        sink.write_all(&state.buf).await?;
        sink.flush().await
    }
    .await;
    match result {
        Ok(()) => {
            metrics::counter!("tern_client_bytes_out_total").increment(state.buf.len() as u64);
            metrics::counter!("tern_client_flushes_total").increment(1);
            state.buf.clear();
            for done in pending.drain(..) {
                let _ = done.send(Ok(()));
            }
            true
        }
        Err(err) => {
            tracing::warn!(error = %err, "socket write failed");
            let failure = Error::WriteFailed(err.to_string());
            state.buf.clear();
            for done in pending.drain(..) {
                let _ = done.send(Err(failure.clone()));
            }
            closed.trip();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::PublishItem;
    use crate::pool::PooledBuf;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (WriteHalf<SocketStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_read, write) = tokio::io::split(SocketStream::Tcp(client));
        (write, server)
    }

    fn publish(subject: &str, payload: &[u8], done: Option<Completion>) -> Command {
        Command::Publish {
            item: PublishItem {
                subject: subject.to_string(),
                reply_to: None,
                headers: None,
                payload: PooledBuf::detached(payload),
            },
            done,
        }
    }

    #[tokio::test]
    async fn priority_lane_precedes_queued_commands() {
        let (write, mut server) = socket_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = oneshot::channel();
        let closed = CloseSignal::new();
        let state = WriterState::new(cmd_rx, 1024 * 1024, 64 * 1024);
        let writer = tokio::spawn(run_writer_loop(state, write, priority_rx, closed.clone()));

        // Queued before the lane is even delivered.
        cmd_tx.send(publish("queued", b"q", None)).expect("send");
        priority_tx
            .send(vec![Command::Ping { done: None }])
            .expect("lane");

        let mut collected = Vec::new();
        while !collected.ends_with(b"PUB queued 1\r\nq\r\n") {
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.expect("read");
            assert!(n > 0, "socket closed early");
            collected.extend_from_slice(&chunk[..n]);
        }
        assert!(collected.starts_with(b"PING\r\n"));

        closed.trip();
        writer.await.expect("writer exits");
    }

    #[tokio::test]
    async fn completions_fire_in_enqueue_order_after_the_flush() {
        let (write, mut server) = socket_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = oneshot::channel();
        let closed = CloseSignal::new();
        let state = WriterState::new(cmd_rx, 1024 * 1024, 64 * 1024);
        let writer = tokio::spawn(run_writer_loop(state, write, priority_rx, closed.clone()));
        priority_tx.send(Vec::new()).expect("lane");

        let mut waiters = Vec::new();
        for index in 0..8 {
            let (tx, rx) = oneshot::channel();
            cmd_tx
                .send(publish(&format!("s.{index}"), b"x", Some(tx)))
                .expect("send");
            waiters.push(rx);
        }
        let drain = tokio::spawn(async move {
            let mut sink = Vec::new();
            let mut chunk = [0u8; 1024];
            while let Ok(n) = server.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                sink.extend_from_slice(&chunk[..n]);
            }
            sink
        });
        for (index, rx) in waiters.into_iter().enumerate() {
            rx.await
                .unwrap_or_else(|_| panic!("completion {index} dropped"))
                .unwrap_or_else(|err| panic!("completion {index} failed: {err}"));
        }
        closed.trip();
        writer.await.expect("writer exits");
        let bytes = drain.await.expect("drain");
        let text = String::from_utf8(bytes).expect("utf8");
        let positions: Vec<usize> = (0..8)
            .map(|index| text.find(&format!("PUB s.{index} ")).expect("frame present"))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn oversized_command_fails_alone_and_batch_continues() {
        let (write, mut server) = socket_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = oneshot::channel();
        let closed = CloseSignal::new();
        let state = WriterState::new(cmd_rx, 8, 64 * 1024);
        let writer = tokio::spawn(run_writer_loop(state, write, priority_rx, closed.clone()));
        priority_tx.send(Vec::new()).expect("lane");

        let (big_tx, big_rx) = oneshot::channel();
        let (ok_tx, ok_rx) = oneshot::channel();
        cmd_tx
            .send(publish("big", b"way past the cap", Some(big_tx)))
            .expect("send");
        cmd_tx.send(publish("ok", b"tiny", Some(ok_tx))).expect("send");

        assert_eq!(
            big_rx.await.expect("completion"),
            Err(Error::MaxPayloadExceeded(8))
        );
        ok_rx.await.expect("completion").expect("small publish ok");

        let mut collected = Vec::new();
        while !collected.ends_with(b"PUB ok 4\r\ntiny\r\n") {
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.expect("read");
            assert!(n > 0);
            collected.extend_from_slice(&chunk[..n]);
        }
        assert!(!collected.windows(7).any(|w| w == b"PUB big"));

        closed.trip();
        writer.await.expect("writer exits");
    }

    #[tokio::test]
    async fn write_failure_fails_the_flush_and_trips_the_signal() {
        let (write, server) = socket_pair().await;
        drop(server);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = oneshot::channel();
        let closed = CloseSignal::new();
        let state = WriterState::new(cmd_rx, 1024, 64 * 1024);
        let writer = tokio::spawn(run_writer_loop(state, write, priority_rx, closed.clone()));
        priority_tx.send(Vec::new()).expect("lane");

        // The first write may land in the kernel buffer of the dead socket;
        // keep publishing until one flush observes the failure.
        let mut failed = false;
        for _ in 0..64 {
            let (tx, rx) = oneshot::channel();
            cmd_tx.send(publish("x", b"payload", Some(tx))).expect("send");
            match rx.await.expect("completion") {
                Ok(()) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
                Err(Error::WriteFailed(_)) => {
                    failed = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(failed, "no flush observed the dead socket");
        assert!(closed.is_tripped());
        let state = writer.await.expect("writer exits");
        // The loop returned its state for the next socket.
        assert!(state.buf.is_empty());
    }
}
