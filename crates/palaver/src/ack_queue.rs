//! Receipt-ordered release of request acknowledgements.
//!
//! The broker redelivers from the first unacked packet on reconnect, so
//! request PUBACKs must go out in the exact order the requests arrived,
//! no matter how handlers interleave. Each received request enqueues its
//! ack handle here at receipt; when its processing finishes (response
//! publish acknowledged, or dropped silent) the slot is marked ready, and
//! acks release from the head for as long as the head is ready.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::transport::AckHandle;

struct Slot {
    seq: u64,
    ack: Option<AckHandle>,
    ready: bool,
}

#[derive(Default)]
pub struct AckQueue {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    slots: VecDeque<Slot>,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a received request's ack handle. Call in delivery order;
    /// the returned sequence number identifies the slot to
    /// [`AckQueue::mark_ready`].
    pub fn enqueue(&self, ack: AckHandle) -> u64 {
        let mut state = lock(&self.inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.push_back(Slot {
            seq,
            ack: Some(ack),
            ready: false,
        });
        seq
    }

    /// Mark a slot releasable and release every ack that is now unblocked,
    /// head first. Returns how many acks went out.
    pub fn mark_ready(&self, seq: u64) -> usize {
        let mut releasable = Vec::new();
        {
            let mut state = lock(&self.inner);
            if let Some(slot) = state.slots.iter_mut().find(|s| s.seq == seq) {
                slot.ready = true;
            }
            while state.slots.front().is_some_and(|s| s.ready) {
                if let Some(slot) = state.slots.pop_front() {
                    releasable.extend(slot.ack);
                }
            }
        }
        // Release outside the lock; the handles call into the transport.
        let count = releasable.len();
        for ack in releasable {
            ack.ack();
        }
        count
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner).slots.len()
    }
}

fn lock(inner: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex as StdMutex};

    fn tracking_queue() -> (AckQueue, Arc<StdMutex<Vec<u64>>>) {
        (AckQueue::new(), Arc::new(StdMutex::new(Vec::new())))
    }

    fn handle(log: &Arc<StdMutex<Vec<u64>>>, id: u64) -> AckHandle {
        let log = log.clone();
        AckHandle::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn in_order_completion_releases_immediately() {
        let (queue, log) = tracking_queue();
        let a = queue.enqueue(handle(&log, 0));
        let b = queue.enqueue(handle(&log, 1));

        assert_eq!(queue.mark_ready(a), 1);
        assert_eq!(queue.mark_ready(b), 1);
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn out_of_order_completion_still_releases_in_receipt_order() {
        let (queue, log) = tracking_queue();
        let a = queue.enqueue(handle(&log, 0));
        let b = queue.enqueue(handle(&log, 1));
        let c = queue.enqueue(handle(&log, 2));

        // Last request finishes first: nothing may release yet.
        assert_eq!(queue.mark_ready(c), 0);
        assert_eq!(queue.mark_ready(b), 0);
        assert!(log.lock().unwrap().is_empty());

        // Head finishes: the whole backlog drains at once, in order.
        assert_eq!(queue.mark_ready(a), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn unknown_seq_is_ignored() {
        let (queue, log) = tracking_queue();
        let a = queue.enqueue(handle(&log, 0));
        assert_eq!(queue.mark_ready(999), 0);
        assert_eq!(queue.mark_ready(a), 1);
    }
}
