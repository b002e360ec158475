use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHasher;
use tracing::debug;

use crate::connection::service_connection::ServiceConnection;
use crate::error::{is_retryable_write_error, ServiceTransportError};
use crate::protocol::messages::ServiceMessage;

/// The order in which connections are tried: linear probing from `start`, wrapping around
pub fn probe_order(start: usize, n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |i| (start + i) % n)
}

/// Stable mapping of a partition key to a connection index, so that messages with the same key
///  keep their relative order
pub fn partition_index(key: &str, n: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % n as u64) as usize
}

#[async_trait]
pub trait WriteTarget: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    async fn write_message(&self, msg: &ServiceMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl WriteTarget for ServiceConnection {
    fn is_connected(&self) -> bool {
        ServiceConnection::is_connected(self)
    }

    async fn write_message(&self, msg: &ServiceMessage) -> anyhow::Result<()> {
        self.write(msg).await
    }
}

/// Writes to the first connected target in probe order, starting at `start`. Targets that fail
///  in a way another connection may not are skipped, other errors are returned right away. Every
///  target is tried at most once. Returns the index of the target that accepted the message.
pub async fn write_with_failover<T: WriteTarget>(targets: &[Arc<T>], start: usize, msg: &ServiceMessage) -> anyhow::Result<usize> {
    let n = targets.len();
    if n == 0 {
        bail!(ServiceTransportError::ServiceConnectionNotActive);
    }

    for idx in probe_order(start % n, n) {
        let target = &targets[idx];
        if !target.is_connected() {
            continue;
        }
        match target.write_message(msg).await {
            Ok(()) => return Ok(idx),
            Err(e) if is_retryable_write_error(&e) => {
                debug!("write to connection #{} failed, trying the next one: {}", idx, e);
            }
            Err(e) => return Err(e),
        }
    }
    bail!(ServiceTransportError::ServiceConnectionNotActive)
}
