//! Protocol reader loop.
//!
//! # Purpose
//! The single consumer of the socket's read half. Feeds raw chunks to the
//! streaming parser and routes each event: INFO to the server-info slot and
//! handshake signal, PING to an enqueued PONG, PONG to the keepalive tracker,
//! MSG/HMSG to the subscription registry, -ERR to the handshake signal or the
//! error log.
//!
//! # Design notes
//! Protocol violations and read errors never propagate past this loop; they
//! trip the closed-signal and the reconnect supervisor takes over. Handler
//! panics are contained inside the registry.
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, oneshot};

use tern_wire::{Parser, ServerInfo, ServerOp};

use crate::client::subscriptions::{Message, SubscriptionRegistry};
use crate::client::ping::PingTracker;
use crate::commands::Command;
use crate::error::{Error, Result};
use crate::socket::{CloseSignal, SocketStream};

/// One-shot signals the handshake driver waits on: first INFO, then the
/// first PONG or -ERR.
pub(crate) struct HandshakeSignals {
    pub(crate) info_tx: Option<oneshot::Sender<ServerInfo>>,
    pub(crate) pong_tx: Option<oneshot::Sender<Result<()>>>,
}

/// Connection state the reader dispatches into; all of it outlives any one
/// socket.
#[derive(Clone)]
pub(crate) struct ReaderShared {
    pub(crate) subs: Arc<SubscriptionRegistry>,
    pub(crate) pings: Arc<PingTracker>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) server_info: Arc<Mutex<Option<ServerInfo>>>,
}

pub(crate) async fn run_reader_loop(
    mut source: ReadHalf<SocketStream>,
    shared: ReaderShared,
    mut signals: HandshakeSignals,
    closed: CloseSignal,
    payload_cap: usize,
) {
    let mut parser = Parser::with_payload_cap(payload_cap);
    loop {
        tokio::select! {
            _ = closed.tripped() => {
                // Drain events already buffered before winding down.
                let _ = dispatch_buffered(&mut parser, &shared, &mut signals);
                break;
            }
            read = source.read_buf(parser.buffer_mut()) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("server closed the connection");
                        closed.trip();
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, "socket read failed");
                        closed.trip();
                        break;
                    }
                }
                if !dispatch_buffered(&mut parser, &shared, &mut signals) {
                    closed.trip();
                    break;
                }
            }
        }
    }
}

/// Drain every complete event currently in the parser. Returns false when
/// the socket must be aborted.
fn dispatch_buffered(
    parser: &mut Parser,
    shared: &ReaderShared,
    signals: &mut HandshakeSignals,
) -> bool {
    loop {
        match parser.next() {
            Ok(Some(op)) => {
                if !dispatch_op(op, shared, signals) {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(err) => {
                tracing::warn!(error = %err, "protocol violation from server");
                metrics::counter!("tern_client_protocol_errors_total").increment(1);
                // During the handshake the driver is waiting; hand it the
                // failure so the attempt surfaces a cause.
                if let Some(tx) = signals.pong_tx.take() {
                    let _ = tx.send(Err(Error::Protocol(err.to_string())));
                }
                return false;
            }
        }
    }
}

fn dispatch_op(op: ServerOp, shared: &ReaderShared, signals: &mut HandshakeSignals) -> bool {
    metrics::counter!("tern_client_ops_in_total").increment(1);
    match op {
        ServerOp::Info(info) => {
            *shared
                .server_info
                .lock()
                .expect("server info lock poisoned") = Some(info.clone());
            if let Some(tx) = signals.info_tx.take() {
                let _ = tx.send(info);
            }
        }
        ServerOp::Ping => {
            let _ = shared.cmd_tx.send(Command::Pong);
        }
        ServerOp::Pong => {
            shared.pings.on_pong();
            if let Some(tx) = signals.pong_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        ServerOp::Ok => {}
        ServerOp::Err(text) => return dispatch_server_error(text, signals),
        ServerOp::Msg {
            subject,
            sid,
            reply_to,
            headers,
            payload,
        } => {
            shared.subs.dispatch(
                sid,
                Message {
                    subject,
                    reply_to,
                    headers,
                    payload,
                },
                &shared.cmd_tx,
            );
        }
    }
    true
}

fn dispatch_server_error(text: String, signals: &mut HandshakeSignals) -> bool {
    // Authorization failures kill the socket; everything else is advisory.
    let fatal = text.to_ascii_lowercase().starts_with("authorization");
    let error = if fatal {
        Error::Auth(text.clone())
    } else {
        Error::Handshake(text.clone())
    };
    if let Some(tx) = signals.pong_tx.take() {
        let _ = tx.send(Err(error));
        return !fatal;
    }
    if fatal {
        tracing::error!(message = %text, "server revoked authorization");
        return false;
    }
    tracing::error!(message = %text, "server error");
    metrics::counter!("tern_client_server_errors_total").increment(1);
    true
}
