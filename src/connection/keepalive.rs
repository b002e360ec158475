use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Tracks the time of the most recent inbound and outbound traffic of a connection. Timestamps
///  are stored as millis since creation so that they can be updated lock-free from the read loop
///  and from writers.
pub struct ActivityTracker {
    base: Instant,
    last_receive_millis: AtomicU64,
    last_send_millis: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> ActivityTracker {
        ActivityTracker {
            base: Instant::now(),
            last_receive_millis: AtomicU64::new(0),
            last_send_millis: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    pub fn on_receive(&self) {
        self.last_receive_millis.store(self.now_millis(), Ordering::Release);
    }

    pub fn on_send(&self) {
        self.last_send_millis.store(self.now_millis(), Ordering::Release);
    }

    /// treat the connection as freshly established
    pub fn reset(&self) {
        let now = self.now_millis();
        self.last_receive_millis.store(now, Ordering::Release);
        self.last_send_millis.store(now, Ordering::Release);
    }

    pub fn since_last_receive(&self) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(self.last_receive_millis.load(Ordering::Acquire)))
    }

    pub fn since_last_send(&self) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(self.last_send_millis.load(Ordering::Acquire)))
    }
}

/// Ends a single connection session. Both the keepalive watchdog and failing writes can abort a
///  session, possibly at the same time - only the first abort counts.
pub struct SessionAbort {
    aborted: AtomicBool,
    notify: Notify,
}

impl SessionAbort {
    pub fn new() -> SessionAbort {
        SessionAbort {
            aborted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// returns `true` only for the call that actually aborted the session
    pub fn abort(&self) -> bool {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}
