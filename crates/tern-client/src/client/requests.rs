//! Request/response registry: one-shot waiters keyed by request id.
//!
//! Reply subjects are `{inbox-prefix}{random-id}.{request-id}`; the random
//! segment is fixed per connection so two connections in one process never
//! share a reply-subject space. A single wildcard subscription on
//! `{inbox-prefix}{random-id}.*` feeds every waiter.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::client::subscriptions::Message;
use crate::error::{Error, Result};

pub(crate) struct RequestRegistry {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Message>>>>,
    next_id: AtomicU64,
    prefix: String,
}

impl RequestRegistry {
    pub(crate) fn new(configured_prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            prefix: format!("{configured_prefix}{}.", Uuid::new_v4().simple()),
        })
    }

    /// Subject of the wildcard subscription that feeds this registry.
    pub(crate) fn wildcard_subject(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Allocate a waiter: (request id, reply subject, response future).
    pub(crate) fn register(&self) -> (u64, String, oneshot::Receiver<Result<Message>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("request registry lock poisoned")
            .insert(id, tx);
        (id, format!("{}{id}", self.prefix), rx)
    }

    /// Cancellation path: forget the waiter without touching the socket.
    pub(crate) fn remove(&self, id: u64) {
        self.waiters
            .lock()
            .expect("request registry lock poisoned")
            .remove(&id);
    }

    /// Route an inbound inbox message to its waiter by the subject tail.
    pub(crate) fn dispatch_subject(&self, subject: &str, message: Message) -> bool {
        let Some(tail) = subject.strip_prefix(&self.prefix) else {
            return false;
        };
        let Ok(id) = tail.parse::<u64>() else {
            return false;
        };
        let waiter = self
            .waiters
            .lock()
            .expect("request registry lock poisoned")
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(message));
                true
            }
            // Late response after a timeout/cancellation; nothing to do.
            None => false,
        }
    }

    /// Fail every pending request, used on connection loss and dispose.
    pub(crate) fn reset(&self, error: Error) {
        let waiters = std::mem::take(
            &mut *self
                .waiters
                .lock()
                .expect("request registry lock poisoned"),
        );
        for (_, tx) in waiters {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.waiters
            .lock()
            .expect("request registry lock poisoned")
            .len()
    }
}

/// Removes the waiter when a request future is dropped before its response.
pub(crate) struct RequestGuard {
    pub(crate) registry: Arc<RequestRegistry>,
    pub(crate) id: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
