//! Graceful-shutdown supervisor: in-flight request accounting and bounded
//! drain.
//!
//! Every data-path handler acquires a ticket on entry; the ticket decrements
//! the counter when dropped, so early returns and panics both release it.
//! Once shutdown begins, new tickets are refused (the caller answers 503),
//! the health endpoint flips to not-ready, and `drain` waits for the counter
//! to reach zero or the deadline to pass.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{info, warn};

pub struct ShutdownSupervisor {
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    started_at: parking_lot::Mutex<Option<Instant>>,
    drained: Notify,
}

/// Point-in-time view of the supervisor, for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSnapshot {
    pub shutting_down: bool,
    pub in_flight: usize,
    pub shutdown_started_at: Option<Instant>,
}

impl ShutdownSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            started_at: parking_lot::Mutex::new(None),
            drained: Notify::new(),
        })
    }

    /// Register a data-path request. Returns `None` once shutdown has begun.
    pub fn on_request_start(self: &Arc<Self>) -> Option<RequestTicket> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // Re-check: shutdown may have started between the load and the add.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.on_request_end();
            return None;
        }
        Some(RequestTicket {
            supervisor: self.clone(),
        })
    }

    fn on_request_end(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Flip into draining mode. Idempotent.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            *self.started_at.lock() = Some(Instant::now());
            info!(
                "Shutdown initiated, {} request(s) in flight",
                self.in_flight.load(Ordering::SeqCst)
            );
        }
    }

    pub fn snapshot(&self) -> ShutdownSnapshot {
        ShutdownSnapshot {
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            shutdown_started_at: *self.started_at.lock(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait for all in-flight requests to finish, up to `timeout`.
    /// Returns `true` when the drain completed, `false` on deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                info!("Drain complete");
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    warn!(
                        "Drain deadline exceeded with {} request(s) still in flight",
                        self.in_flight.load(Ordering::SeqCst)
                    );
                    return false;
                }
            };
            // Wake on the last ticket drop or poll again at the deadline.
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
    }
}

/// Guard for one in-flight data-path request.
pub struct RequestTicket {
    supervisor: Arc<ShutdownSupervisor>,
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        self.supervisor.on_request_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_counts() {
        let sup = ShutdownSupervisor::new();
        assert_eq!(sup.snapshot().in_flight, 0);

        let t1 = sup.on_request_start().unwrap();
        let t2 = sup.on_request_start().unwrap();
        assert_eq!(sup.snapshot().in_flight, 2);

        drop(t1);
        assert_eq!(sup.snapshot().in_flight, 1);
        drop(t2);
        assert_eq!(sup.snapshot().in_flight, 0);
    }

    #[test]
    fn test_no_tickets_after_shutdown() {
        let sup = ShutdownSupervisor::new();
        assert!(!sup.snapshot().shutting_down);
        sup.begin_shutdown();
        assert!(sup.snapshot().shutting_down);
        assert!(sup.snapshot().shutdown_started_at.is_some());
        assert!(sup.on_request_start().is_none());
        assert_eq!(sup.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_drain_completes_when_tickets_drop() {
        let sup = ShutdownSupervisor::new();
        let ticket = sup.on_request_start().unwrap();
        sup.begin_shutdown();

        let sup2 = sup.clone();
        let handle = tokio::spawn(async move { sup2.drain(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(ticket);

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_times_out_with_stuck_request() {
        let sup = ShutdownSupervisor::new();
        let _stuck = sup.on_request_start().unwrap();
        sup.begin_shutdown();
        assert!(!sup.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_drain_immediate_when_idle() {
        let sup = ShutdownSupervisor::new();
        sup.begin_shutdown();
        assert!(sup.drain(Duration::from_millis(10)).await);
    }
}
