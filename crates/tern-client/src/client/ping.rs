// Keepalive: periodic PING with an outstanding-pong watchdog.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::commands::Command;
use crate::socket::CloseSignal;

/// Shared between the timer (increments), the reader (PONG decrements), and
/// user `ping()` calls (RTT waiters).
pub(crate) struct PingTracker {
    outstanding: AtomicU32,
    rtt_waiters: Mutex<VecDeque<(Instant, oneshot::Sender<Duration>)>>,
}

impl PingTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outstanding: AtomicU32::new(0),
            rtt_waiters: Mutex::new(VecDeque::new()),
        })
    }

    /// Inbound PONG: decrement (floor 0) and complete the oldest RTT waiter.
    pub(crate) fn on_pong(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
        let waiter = self
            .rtt_waiters
            .lock()
            .expect("ping tracker lock poisoned")
            .pop_front();
        if let Some((started, tx)) = waiter {
            let _ = tx.send(started.elapsed());
        }
    }

    /// Register a user RTT waiter before its PING command is enqueued.
    pub(crate) fn register_rtt(&self) -> oneshot::Receiver<Duration> {
        let (tx, rx) = oneshot::channel();
        self.rtt_waiters
            .lock()
            .expect("ping tracker lock poisoned")
            .push_back((Instant::now(), tx));
        rx
    }

    fn bump(&self) -> u32 {
        self.outstanding.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Drop all waiters (their receivers observe the loss) and zero the
    /// counter; called on reconnect and dispose.
    pub(crate) fn reset(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
        self.rtt_waiters
            .lock()
            .expect("ping tracker lock poisoned")
            .clear();
    }
}

pub(crate) async fn run_ping_timer(
    interval: Duration,
    max_pings_out: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    tracker: Arc<PingTracker>,
    closed: CloseSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first PING goes out one full interval after Open.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = closed.tripped() => break,
            _ = ticker.tick() => {
                let outstanding = tracker.bump();
                if outstanding > max_pings_out {
                    tracing::warn!(outstanding, max_pings_out, "server unresponsive; aborting socket");
                    metrics::counter!("tern_client_ping_watchdog_aborts_total").increment(1);
                    closed.trip();
                    break;
                }
                if cmd_tx.send(Command::Ping { done: None }).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_floors_the_counter_at_zero() {
        let tracker = PingTracker::new();
        tracker.on_pong();
        assert_eq!(tracker.outstanding(), 0);
        tracker.bump();
        tracker.bump();
        tracker.on_pong();
        assert_eq!(tracker.outstanding(), 1);
    }

    #[tokio::test]
    async fn pong_completes_the_oldest_rtt_waiter() {
        let tracker = PingTracker::new();
        let first = tracker.register_rtt();
        let second = tracker.register_rtt();
        tracker.on_pong();
        let rtt = first.await.expect("first waiter");
        assert!(rtt >= Duration::ZERO);
        tracker.on_pong();
        second.await.expect("second waiter");
    }

    #[tokio::test]
    async fn reset_drops_waiters() {
        let tracker = PingTracker::new();
        let waiter = tracker.register_rtt();
        tracker.bump();
        tracker.reset();
        assert_eq!(tracker.outstanding(), 0);
        assert!(waiter.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_trips_after_max_pings_out_is_exceeded() {
        let tracker = PingTracker::new();
        let closed = CloseSignal::new();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let timer = tokio::spawn(run_ping_timer(
            Duration::from_secs(1),
            2,
            cmd_tx,
            Arc::clone(&tracker),
            closed.clone(),
        ));
        timer.await.expect("timer exits");
        assert!(closed.is_tripped());
        // Two PINGs were sent before the third tick tripped the watchdog.
        let mut pings = 0;
        while let Ok(command) = cmd_rx.try_recv() {
            assert!(matches!(command, Command::Ping { .. }));
            pings += 1;
        }
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_timer_alive() {
        let tracker = PingTracker::new();
        let closed = CloseSignal::new();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let timer = tokio::spawn(run_ping_timer(
            Duration::from_secs(1),
            1,
            cmd_tx,
            Arc::clone(&tracker),
            closed.clone(),
        ));
        // Answer every PING as it is enqueued.
        for _ in 0..5 {
            let command = cmd_rx.recv().await.expect("ping");
            assert!(matches!(command, Command::Ping { .. }));
            tracker.on_pong();
        }
        assert!(!closed.is_tripped());
        closed.trip();
        timer.await.expect("timer exits");
    }
}
