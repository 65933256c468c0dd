//! Invoker-side table of in-flight requests.
//!
//! One entry per outstanding correlation id. The routing loop completes an
//! entry with the first matching response; the guard returned at
//! registration removes the entry when the caller gives up (timeout or
//! cancellation), so late responses find nothing and are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::headers::ResponseHeaders;

/// What a completed invocation receives: the parsed response headers and
/// the raw payload, or the error that ended the wait.
pub type Completion = Result<(ResponseHeaders, Bytes), ProtocolError>;

type Table = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Completion>>>>;

#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Table,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh correlation id. Returns the receiver the caller
    /// awaits and a guard that removes the entry on drop.
    pub fn register(
        &self,
        correlation_id: Uuid,
    ) -> Result<(PendingGuard, oneshot::Receiver<Completion>), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = lock(&self.inner);
        if entries.contains_key(&correlation_id) {
            // Freshly generated UUIDs colliding means something upstream is
            // broken, not unlucky.
            return Err(ProtocolError::internal_logic(format!(
                "correlation id {correlation_id} already pending"
            )));
        }
        entries.insert(correlation_id, tx);
        Ok((
            PendingGuard {
                inner: self.inner.clone(),
                correlation_id,
            },
            rx,
        ))
    }

    /// Deliver a completion. Returns false when no entry matches: an
    /// unknown correlation id or a duplicate response, both discarded by
    /// the caller.
    pub fn complete(&self, correlation_id: &Uuid, completion: Completion) -> bool {
        let entry = lock(&self.inner).remove(correlation_id);
        match entry {
            Some(tx) => tx.send(completion).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request, draining the table. Used when the
    /// session is lost and no response can arrive anymore.
    pub fn fail_all(&self, make_error: impl Fn() -> ProtocolError) {
        let entries: Vec<_> = {
            let mut table = lock(&self.inner);
            table.drain().collect()
        };
        for (_, tx) in entries {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its pending entry on drop unless a completion got there first.
#[derive(Debug)]
pub struct PendingGuard {
    inner: Table,
    correlation_id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.inner).remove(&self.correlation_id);
    }
}

fn lock(
    inner: &Mutex<HashMap<Uuid, oneshot::Sender<Completion>>>,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Completion>>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
