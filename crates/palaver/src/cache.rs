//! Correlation-keyed response cache (executor side).
//!
//! The cache gives the executor its effectively-once behavior: the first
//! receipt of a correlation id reserves the slot and runs the handler,
//! concurrent duplicates attach as waiters, and later duplicates replay the
//! stored response for as long as the retention window allows. At most one
//! build is ever in flight per correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::headers::ResponseHeaders;

/// A finished response, stored for replay to duplicate requests.
///
/// No message expiry is stored; each publish recomputes it from the expiry
/// window of the request that triggered that publish.
#[derive(Debug)]
pub struct CachedResponse {
    pub payload: Bytes,
    pub headers: ResponseHeaders,
    /// Where the response goes: the request's response topic.
    pub topic: String,
}

enum Slot {
    Building {
        waiters: Vec<oneshot::Sender<Arc<CachedResponse>>>,
    },
    Ready {
        response: Arc<CachedResponse>,
        deadline: Instant,
    },
}

/// Outcome of [`ResponseCache::try_reserve`].
pub enum Reservation {
    /// This caller owns the build. Publish through the guard or drop it to
    /// release the slot.
    Reserved(ReservationGuard),
    /// A finished response is cached; replay it.
    Hit(Arc<CachedResponse>),
    /// Another receipt of the same correlation id is mid-build; await the
    /// receiver. A closed channel means the builder dropped out silently,
    /// and the duplicate should too.
    InFlight(oneshot::Receiver<Arc<CachedResponse>>),
}

#[derive(Clone, Default)]
pub struct ResponseCache {
    inner: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_reserve(&self, correlation_id: Uuid, now: Instant) -> Reservation {
        let mut entries = lock(&self.inner);
        match entries.get_mut(&correlation_id) {
            Some(Slot::Building { waiters }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Reservation::InFlight(rx)
            }
            Some(Slot::Ready { response, deadline }) if *deadline > now => {
                Reservation::Hit(response.clone())
            }
            _ => {
                // Vacant, or a stale entry the sweeper hasn't reached yet.
                entries.insert(correlation_id, Slot::Building { waiters: Vec::new() });
                Reservation::Reserved(ReservationGuard {
                    inner: self.inner.clone(),
                    correlation_id,
                    published: false,
                })
            }
        }
    }

    /// Evict finished entries whose retention deadline has passed. Entries
    /// still building are left alone; their guard owns their lifecycle.
    pub fn sweep(&self, now: Instant) {
        lock(&self.inner).retain(|_, slot| match slot {
            Slot::Building { .. } => true,
            Slot::Ready { deadline, .. } => *deadline > now,
        });
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to build the response for one correlation id.
pub struct ReservationGuard {
    inner: Arc<Mutex<HashMap<Uuid, Slot>>>,
    correlation_id: Uuid,
    published: bool,
}

impl ReservationGuard {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Promote the reservation to a finished entry retained until
    /// `deadline`, waking every coalesced duplicate with the response.
    pub fn publish(mut self, response: Arc<CachedResponse>, deadline: Instant) {
        self.published = true;
        let waiters = {
            let mut entries = lock(&self.inner);
            let previous = entries.insert(
                self.correlation_id,
                Slot::Ready {
                    response: response.clone(),
                    deadline,
                },
            );
            match previous {
                Some(Slot::Building { waiters }) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(response.clone());
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // The build ended without a response (dropped-silent path). Remove
        // the placeholder; dropping the waiter senders tells coalesced
        // duplicates to go silent too.
        let mut entries = lock(&self.inner);
        if matches!(entries.get(&self.correlation_id), Some(Slot::Building { .. })) {
            entries.remove(&self.correlation_id);
        }
    }
}

fn lock(
    inner: &Mutex<HashMap<Uuid, Slot>>,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, Slot>> {
    // Entry manipulation never panics while holding the lock.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use crate::hlc::HybridLogicalClock;
    use std::time::Duration;

    fn response() -> Arc<CachedResponse> {
        Arc::new(CachedResponse {
            payload: Bytes::from_static(b"42"),
            headers: ResponseHeaders::ok(Uuid::new_v4(), HybridLogicalClock::new(1, 0, "exec")),
            topic: "clients/chef-1/responses".into(),
        })
    }

    #[test]
    fn first_receipt_reserves() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        assert!(matches!(
            cache.try_reserve(Uuid::new_v4(), now),
            Reservation::Reserved(_)
        ));
    }

    #[test]
    fn published_entry_replays_until_deadline() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let cid = Uuid::new_v4();

        let guard = match cache.try_reserve(cid, now) {
            Reservation::Reserved(g) => g,
            _ => panic!("expected reservation"),
        };
        guard.publish(response(), now + Duration::from_secs(10));

        match cache.try_reserve(cid, now + Duration::from_secs(9)) {
            Reservation::Hit(r) => assert_eq!(r.payload.as_ref(), b"42"),
            _ => panic!("expected hit"),
        }
        // Past the deadline the slot is re-reservable even before a sweep.
        assert!(matches!(
            cache.try_reserve(cid, now + Duration::from_secs(11)),
            Reservation::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_duplicates_coalesce() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let cid = Uuid::new_v4();

        let guard = match cache.try_reserve(cid, now) {
            Reservation::Reserved(g) => g,
            _ => panic!("expected reservation"),
        };
        let rx1 = match cache.try_reserve(cid, now) {
            Reservation::InFlight(rx) => rx,
            _ => panic!("expected in-flight"),
        };
        let rx2 = match cache.try_reserve(cid, now) {
            Reservation::InFlight(rx) => rx,
            _ => panic!("expected in-flight"),
        };

        guard.publish(response(), now + Duration::from_secs(10));

        let r1 = rx1.await.unwrap();
        let r2 = rx2.await.unwrap();
        assert_eq!(r1.headers.status, StatusCode::Ok);
        assert_eq!(r1.payload, r2.payload);
    }

    #[tokio::test]
    async fn dropped_guard_cancels_waiters() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let cid = Uuid::new_v4();

        let guard = match cache.try_reserve(cid, now) {
            Reservation::Reserved(g) => g,
            _ => panic!("expected reservation"),
        };
        let rx = match cache.try_reserve(cid, now) {
            Reservation::InFlight(rx) => rx,
            _ => panic!("expected in-flight"),
        };

        drop(guard);
        assert!(rx.await.is_err());
        // Slot is free again.
        assert!(matches!(
            cache.try_reserve(cid, now),
            Reservation::Reserved(_)
        ));
    }

    #[test]
    fn sweep_evicts_only_expired_finished_entries() {
        let cache = ResponseCache::new();
        let now = Instant::now();

        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let building = Uuid::new_v4();

        match cache.try_reserve(fresh, now) {
            Reservation::Reserved(g) => g.publish(response(), now + Duration::from_secs(60)),
            _ => panic!(),
        }
        match cache.try_reserve(stale, now) {
            Reservation::Reserved(g) => g.publish(response(), now + Duration::from_secs(1)),
            _ => panic!(),
        }
        let _guard = match cache.try_reserve(building, now) {
            Reservation::Reserved(g) => g,
            _ => panic!(),
        };

        cache.sweep(now + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.try_reserve(fresh, now + Duration::from_secs(2)),
            Reservation::Hit(_)
        ));
        assert!(matches!(
            cache.try_reserve(building, now + Duration::from_secs(2)),
            Reservation::InFlight(_)
        ));
    }
}
