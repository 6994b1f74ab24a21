//! Subscription registry and subscriber handles.
//!
//! # Purpose
//! Maps server-echoed sids to consumers. The reader loop calls
//! [`SubscriptionRegistry::dispatch`] for every inbound MSG/HMSG; the
//! registry owns the sid space and the replay snapshot used on reconnect.
//!
//! # Design notes
//! Routing is per-sid, not per-subject; the server binds sid → subject at SUB
//! time. Handler failures (panics, responder errors) are logged and never
//! reach the reader, which would otherwise tear the socket down.
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tern_wire::HeaderMap;

use crate::commands::{Command, PublishItem, ReplayEntry};
use crate::pool::PooledBuf;

/// One message delivered to a subscription or request waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

pub(crate) type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub(crate) type RequestHandler =
    Arc<dyn Fn(Message) -> crate::error::Result<Bytes> + Send + Sync>;

enum SubHandler {
    Stream(MessageHandler),
    Responder(RequestHandler),
}

struct SubEntry {
    subject: String,
    queue_group: Option<String>,
    handler: SubHandler,
}

pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, SubEntry>>,
    next_sid: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
        })
    }

    /// Record a stream subscription and return its sid. The caller enqueues
    /// the SUB command after this so an inbound MSG can never race the entry.
    pub(crate) fn add(
        &self,
        subject: String,
        queue_group: Option<String>,
        handler: MessageHandler,
    ) -> u64 {
        self.insert(subject, queue_group, SubHandler::Stream(handler))
    }

    /// Record a request-responder subscription; inbound messages are decoded,
    /// handled, and the reply published to the message's reply-to.
    pub(crate) fn add_responder(&self, subject: String, handler: RequestHandler) -> u64 {
        self.insert(subject, None, SubHandler::Responder(handler))
    }

    fn insert(&self, subject: String, queue_group: Option<String>, handler: SubHandler) -> u64 {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("subscription registry lock poisoned")
            .insert(
                sid,
                SubEntry {
                    subject,
                    queue_group,
                    handler,
                },
            );
        sid
    }

    pub(crate) fn remove(&self, sid: u64) -> bool {
        self.entries
            .lock()
            .expect("subscription registry lock poisoned")
            .remove(&sid)
            .is_some()
    }

    /// Snapshot of active subscriptions for SUB replay on a new socket.
    pub(crate) fn replay_entries(&self) -> Vec<ReplayEntry> {
        let entries = self
            .entries
            .lock()
            .expect("subscription registry lock poisoned");
        let mut replay: Vec<ReplayEntry> = entries
            .iter()
            .map(|(sid, entry)| ReplayEntry {
                sid: *sid,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
            })
            .collect();
        // Stable order keeps server-side SUB accounting deterministic.
        replay.sort_by_key(|entry| entry.sid);
        replay
    }

    /// O(1) sid lookup and handler invocation. Runs on the reader task; the
    /// lock is released before the handler runs.
    pub(crate) fn dispatch(
        &self,
        sid: u64,
        message: Message,
        cmd_tx: &mpsc::UnboundedSender<Command>,
    ) {
        let handler = {
            let entries = self
                .entries
                .lock()
                .expect("subscription registry lock poisoned");
            match entries.get(&sid) {
                Some(entry) => match &entry.handler {
                    SubHandler::Stream(handler) => SubHandler::Stream(Arc::clone(handler)),
                    SubHandler::Responder(handler) => SubHandler::Responder(Arc::clone(handler)),
                },
                None => {
                    // Expected during unsubscribe races; the server may still
                    // have frames in flight for a sid we already dropped.
                    tracing::debug!(sid, subject = %message.subject, "message for unknown sid");
                    metrics::counter!("tern_client_unroutable_msgs_total").increment(1);
                    return;
                }
            }
        };
        match handler {
            SubHandler::Stream(handler) => {
                let subject = message.subject.clone();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
                    tracing::warn!(sid, subject = %subject, panic = ?panic, "subscription handler panicked");
                }
            }
            SubHandler::Responder(handler) => {
                let reply_to = message.reply_to.clone();
                let subject = message.subject.clone();
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(message)));
                let reply = match outcome {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(err)) => {
                        tracing::warn!(sid, subject = %subject, error = %err, "request handler failed");
                        return;
                    }
                    Err(panic) => {
                        tracing::warn!(sid, subject = %subject, panic = ?panic, "request handler panicked");
                        return;
                    }
                };
                let Some(reply_to) = reply_to else {
                    tracing::debug!(sid, subject = %subject, "request without reply-to; response dropped");
                    return;
                };
                let _ = cmd_tx.send(Command::Publish {
                    item: PublishItem {
                        subject: reply_to,
                        reply_to: None,
                        headers: None,
                        payload: PooledBuf::detached(&reply),
                    },
                    done: None,
                });
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .expect("subscription registry lock poisoned")
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("subscription registry lock poisoned")
            .len()
    }
}

fn release(registry: &SubscriptionRegistry, cmd_tx: &mpsc::UnboundedSender<Command>, sid: u64) {
    if registry.remove(sid) {
        let _ = cmd_tx.send(Command::Unsubscribe {
            sid,
            max_msgs: None,
            done: None,
        });
    }
}

/// Pull-style subscription; dropping it unsubscribes.
pub struct Subscriber {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) rx: mpsc::UnboundedReceiver<Message>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Subscriber {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the connection is disposed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Ask the server to stop delivery after `max_msgs` more messages. The
    /// local entry stays until the handle drops.
    pub fn unsubscribe_after(&self, max_msgs: u64) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            sid: self.sid,
            max_msgs: Some(max_msgs),
            done: None,
        });
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        release(&self.registry, &self.cmd_tx, self.sid);
    }
}

/// Handle for a callback-style subscription; dropping it unsubscribes.
pub struct SubscriptionHandle {
    pub(crate) sid: u64,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        release(&self.registry, &self.cmd_tx, self.sid);
    }
}
