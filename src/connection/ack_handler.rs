use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::protocol::messages::AckStatus;

/// Correlates ack-capable outbound messages with the service's `Ack` replies. One handler is shared
///  by all connections of a pool: the ack may arrive on a different connection than the one the
///  message was sent on.
pub struct AckHandler {
    next_id: AtomicI32,
    pending: Mutex<FxHashMap<i32, oneshot::Sender<AckStatus>>>,
    ack_timeout: Duration,
}

impl AckHandler {
    pub fn new(ack_timeout: Duration) -> AckHandler {
        AckHandler {
            next_id: AtomicI32::new(1),
            pending: Default::default(),
            ack_timeout,
        }
    }

    /// Allocates an ack id that is not currently pending. The registration is removed when the
    ///  returned [PendingAck] is dropped, whether or not the ack arrived.
    pub fn register(self: &Arc<Self>) -> PendingAck {
        let (send, recv) = oneshot::channel();

        let mut pending = self.pending.lock()
            .unwrap_or_else(|e| e.into_inner());

        let ack_id = loop {
            // ids stay positive, wrapping from i32::MAX to 1
            let candidate = self.next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(if id >= i32::MAX { 1 } else { id + 1 }))
                .unwrap_or_else(|id| id);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(ack_id, send);
        trace!("registered ack id {}", ack_id);

        PendingAck {
            ack_id,
            recv: Some(recv),
            handler: self.clone(),
        }
    }

    /// Completes the pending ack with the given id. Returns `false` for unknown ids, e.g. for acks
    ///  that arrive after their waiter timed out.
    pub fn trigger_ack(&self, ack_id: i32, status: AckStatus) -> bool {
        let sender = self.pending.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ack_id);

        match sender {
            Some(sender) => {
                // the waiter may have gone away in the meantime, which is fine
                let _ = sender.send(status);
                true
            }
            None => {
                debug!("received ack for unknown ack id {} - ignoring", ack_id);
                false
            }
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn unregister(&self, ack_id: i32) {
        self.pending.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ack_id);
    }
}

pub struct PendingAck {
    ack_id: i32,
    recv: Option<oneshot::Receiver<AckStatus>>,
    handler: Arc<AckHandler>,
}

impl PendingAck {
    pub fn ack_id(&self) -> i32 {
        self.ack_id
    }

    /// Waits for the ack, giving up after the handler's ack timeout
    pub async fn wait(mut self) -> AckStatus {
        let recv = match self.recv.take() {
            Some(recv) => recv,
            None => return AckStatus::Timeout,
        };

        match tokio::time::timeout(self.handler.ack_timeout, recv).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => AckStatus::Timeout,
            Err(_) => {
                debug!("no ack for ack id {} after {:?}", self.ack_id, self.handler.ack_timeout);
                AckStatus::Timeout
            }
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.handler.unregister(self.ack_id);
    }
}
