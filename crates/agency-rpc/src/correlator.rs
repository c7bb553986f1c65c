//! Client-side bookkeeping for outstanding calls.
//!
//! Each call gets the next id from a monotonic counter and a oneshot channel
//! parked in the pending table. A matching response removes the entry;
//! otherwise dropping the [`PendingCall`] does, whether it timed out or its
//! caller went away. A late response then finds nothing to resolve.

use crate::error::{ErrorObject, Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Resolution delivered to a waiting caller.
pub type Outcome = std::result::Result<Value, Settled>;

/// Why a pending call did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// The peer answered with an error envelope.
    Remote(ErrorObject),
    /// The connection went away first.
    Abandoned,
}

/// Table of outstanding calls keyed by id.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and park a waiter for it.
    pub fn register(self: &Arc<Self>) -> PendingCall {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);

        PendingCall {
            id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Resolve the call with `id`. Returns false when nothing was waiting.
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            debug!("dropping response for unknown call id {}", id);
            return false;
        };
        // The waiter may have given up concurrently; that is fine.
        let _ = tx.send(outcome);
        true
    }

    /// Drop the entry for `id` without resolving it.
    pub fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Fail every outstanding call. Returns how many were waiting.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Settled::Abandoned));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Outcome>>> {
        // A poisoned table only means a panic elsewhere; the map itself is intact.
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiter for one outstanding call.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response. A zero `timeout` waits indefinitely.
    pub async fn wait(mut self, method: &str, timeout: Duration) -> Result<Value> {
        let received = if timeout.is_zero() {
            (&mut self.rx).await
        } else {
            match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(RpcError::Timeout {
                        method: method.to_string(),
                        after: timeout,
                    });
                }
            }
        };

        match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Settled::Remote(err))) => Err(RpcError::Remote(err)),
            Ok(Err(Settled::Abandoned)) | Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Give up on the call before waiting (e.g. the send failed).
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // No-op once resolved; otherwise the waiter gave up.
        self.table.forget(self.id);
    }
}
