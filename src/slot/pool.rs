//! Per-job slot pool.
//!
//! Mirrors `renoir::config::RuntimeConfig`'s habit of keeping a
//! `thiserror` enum next to the state it governs, and the single-owner
//! mutex-per-collection style used throughout the networking code:
//! every bucket lives behind its own `parking_lot::Mutex` and is only ever
//! touched by the pool's own methods.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use coarsetime::Instant;
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::{AllocationId, IdGenerator, SlotId, SlotRequestId, WorkerId};
use crate::resource::ResourceProfile;
use crate::slot::types::{AllocatedSlot, SlotOffer, SlotPoolTimeouts, SlotRequestMode};

#[derive(Debug, Error, Clone)]
pub enum SlotPoolError {
    #[error("no slot currently matches the requested profile")]
    NoResource,
    #[error("slot request timed out")]
    Timeout,
    #[error("slot request was cancelled: {0}")]
    Cancelled(String),
    #[error("slot request was released: {0}")]
    Released(String),
}

impl SlotPoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlotPoolError::NoResource => ErrorKind::NoResource,
            SlotPoolError::Timeout => ErrorKind::Timeout,
            SlotPoolError::Cancelled(_) => ErrorKind::Cancellation,
            SlotPoolError::Released(_) => ErrorKind::SlotAllocation,
        }
    }
}

/// The pool's view of the cluster-wide broker: the slot manager (§4.G), or
/// a stand-in for tests.
pub trait SlotBroker: Send + Sync {
    fn request_slot(&self, request_id: SlotRequestId, profile: ResourceProfile);
    fn release_slot(&self, allocation_id: AllocationId);
}

struct PendingRequest {
    profile: ResourceProfile,
    mode: SlotRequestMode,
    created_at: Instant,
    timeout: Duration,
    completion: flume::Sender<Result<AllocatedSlot, SlotPoolError>>,
    /// An allocation the pool expects will fulfil this request, set when
    /// the broker has earmarked one out of band. Cleared by orphan
    /// remapping if a different request ends up claiming it first.
    expected_allocation: Option<AllocationId>,
}

struct AvailableSlot {
    slot: AllocatedSlot,
    idle_since: Instant,
}

/// Per-job slot pool: tracks pending/allocated/available slots and talks to
/// a single cluster broker.
pub struct SlotPool {
    broker: Mutex<Option<Arc<dyn SlotBroker>>>,
    registered_workers: Mutex<HashSet<WorkerId>>,

    pending: Mutex<HashMap<SlotRequestId, PendingRequest>>,
    /// Requests that haven't been forwarded yet because no broker was
    /// connected when they were created.
    waiting_for_broker: Mutex<HashSet<SlotRequestId>>,

    allocated: Mutex<HashMap<SlotRequestId, AllocatedSlot>>,
    allocated_by_worker: Mutex<HashMap<WorkerId, HashSet<SlotRequestId>>>,
    /// Bound allocation -> owning request, used to detect duplicate offers
    /// and to route `fail_allocation`.
    allocation_index: Mutex<HashMap<AllocationId, SlotRequestId>>,
    /// Every (worker, slot, allocation) tuple ever accepted, so a repeated
    /// identical offer can be acknowledged without double-adding.
    accepted_offers: Mutex<HashSet<(WorkerId, SlotId, AllocationId)>>,

    available: Mutex<IndexMap<SlotId, AvailableSlot>>,

    timeouts: SlotPoolTimeouts,
    ids: IdGenerator,
}

impl SlotPool {
    pub fn new(timeouts: SlotPoolTimeouts) -> Self {
        Self {
            broker: Mutex::new(None),
            registered_workers: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            waiting_for_broker: Mutex::new(HashSet::new()),
            allocated: Mutex::new(HashMap::new()),
            allocated_by_worker: Mutex::new(HashMap::new()),
            allocation_index: Mutex::new(HashMap::new()),
            accepted_offers: Mutex::new(HashSet::new()),
            available: Mutex::new(IndexMap::new()),
            timeouts,
            ids: IdGenerator::new(),
        }
    }

    pub fn next_request_id(&self) -> SlotRequestId {
        SlotRequestId(self.ids.next())
    }

    /// Connects the broker and forwards every request that was stashed
    /// while disconnected.
    pub fn connect_broker(&self, broker: Arc<dyn SlotBroker>) {
        let stashed: Vec<SlotRequestId> = {
            let mut waiting = self.waiting_for_broker.lock();
            waiting.drain().collect()
        };
        *self.broker.lock() = Some(broker.clone());
        let pending = self.pending.lock();
        for id in stashed {
            if let Some(req) = pending.get(&id) {
                log::debug!("forwarding stashed slot request {id} to broker");
                broker.request_slot(id, req.profile);
            }
        }
    }

    pub fn disconnect_broker(&self) {
        *self.broker.lock() = None;
    }

    pub fn register_worker(&self, worker: WorkerId) {
        self.registered_workers.lock().insert(worker);
    }

    /// Releases every slot (available or allocated) belonging to `worker`;
    /// allocated slots fail their owning request.
    pub fn release_worker(&self, worker: WorkerId) {
        self.registered_workers.lock().remove(&worker);

        let mut available = self.available.lock();
        available.retain(|_, s| s.slot.worker_id != worker);
        drop(available);

        let owned: Vec<SlotRequestId> = self
            .allocated_by_worker
            .lock()
            .remove(&worker)
            .unwrap_or_default()
            .into_iter()
            .collect();
        for request_id in owned {
            self.release_slot(request_id, "worker released".to_string());
        }
    }

    /// Requests a new slot. Completes (via the returned receiver) with the
    /// slot when one is offered, or fails with `no-resource`/`timeout`.
    pub fn request_new_slot(
        &self,
        request_id: SlotRequestId,
        profile: ResourceProfile,
        mode: SlotRequestMode,
        timeout: Option<Duration>,
    ) -> flume::Receiver<Result<AllocatedSlot, SlotPoolError>> {
        let (tx, rx) = flume::bounded(1);

        if let Some(slot) = self.take_matching_available(&profile) {
            self.bind(request_id, slot);
            let _ = tx.send(Ok(self.allocated.lock()[&request_id]));
            return rx;
        }

        let req = PendingRequest {
            profile,
            mode,
            created_at: Instant::now(),
            timeout: timeout.unwrap_or(self.timeouts.request_timeout),
            completion: tx,
            expected_allocation: None,
        };
        self.pending.lock().insert(request_id, req);

        let broker = self.broker.lock().clone();
        match broker {
            Some(b) => {
                log::debug!("forwarding slot request {request_id} to broker");
                b.request_slot(request_id, profile);
            }
            None => {
                self.waiting_for_broker.lock().insert(request_id);
            }
        }
        rx
    }

    /// Lets a caller record that a specific allocation is expected to
    /// fulfil `request_id` (the broker has earmarked it out of band). Used
    /// to exercise orphan remapping deterministically in tests and by a
    /// broker integration that communicates reservations ahead of the
    /// concrete offer.
    pub fn earmark(&self, request_id: SlotRequestId, allocation_id: AllocationId) {
        if let Some(req) = self.pending.lock().get_mut(&request_id) {
            req.expected_allocation = Some(allocation_id);
        }
    }

    fn take_matching_available(&self, profile: &ResourceProfile) -> Option<AllocatedSlot> {
        let mut available = self.available.lock();
        // Prefer the least-utilized worker among matches.
        let utilization = self.worker_utilization();
        let best = available
            .iter()
            .filter(|(_, s)| s.slot.resources.matches(profile))
            .min_by(|(_, a), (_, b)| {
                let ua = utilization.get(&a.slot.worker_id).copied().unwrap_or(0.0);
                let ub = utilization.get(&b.slot.worker_id).copied().unwrap_or(0.0);
                ua.partial_cmp(&ub).unwrap()
            })
            .map(|(id, _)| *id);
        best.and_then(|id| available.shift_remove(&id)).map(|s| s.slot)
    }

    fn worker_utilization(&self) -> HashMap<WorkerId, f64> {
        let allocated_by_worker = self.allocated_by_worker.lock();
        let available = self.available.lock();
        let mut free_by_worker: HashMap<WorkerId, usize> = HashMap::new();
        for s in available.values() {
            *free_by_worker.entry(s.slot.worker_id).or_insert(0) += 1;
        }
        let mut out = HashMap::new();
        let workers: HashSet<WorkerId> = allocated_by_worker
            .keys()
            .copied()
            .chain(free_by_worker.keys().copied())
            .collect();
        for w in workers {
            let allocated = allocated_by_worker.get(&w).map(|s| s.len()).unwrap_or(0) as f64;
            let free = *free_by_worker.get(&w).unwrap_or(&0) as f64;
            let total = allocated + free;
            out.insert(w, if total > 0.0 { allocated / total } else { 0.0 });
        }
        out
    }

    fn bind(&self, request_id: SlotRequestId, slot: AllocatedSlot) {
        self.allocation_index
            .lock()
            .insert(slot.allocation_id, request_id);
        self.allocated_by_worker
            .lock()
            .entry(slot.worker_id)
            .or_default()
            .insert(request_id);
        self.allocated.lock().insert(request_id, slot);
    }

    /// Accepts a worker's slot offer. Returns `true` if the offer was
    /// accepted (including a duplicate re-offer, which is acknowledged
    /// positively without double-adding).
    pub fn offer_slot(&self, worker: WorkerId, offer: SlotOffer) -> bool {
        if !self.registered_workers.lock().contains(&worker) {
            return false;
        }

        let dedupe_key = (worker, offer.slot_id, offer.allocation_id);
        if self.accepted_offers.lock().contains(&dedupe_key) {
            return true; // already accepted; idempotent ack.
        }

        // An offer colliding on allocation-id but differing on slot-id is
        // rejected.
        if let Some(existing_request) = self.allocation_index.lock().get(&offer.allocation_id).copied()
        {
            if let Some(existing) = self.allocated.lock().get(&existing_request) {
                if existing.slot_id != offer.slot_id {
                    log::warn!(
                        "rejecting offer: allocation {} already bound to a different slot",
                        offer.allocation_id
                    );
                    return false;
                }
            }
            self.accepted_offers.lock().insert(dedupe_key);
            return true;
        }

        self.accepted_offers.lock().insert(dedupe_key);

        let slot = AllocatedSlot {
            slot_id: offer.slot_id,
            allocation_id: offer.allocation_id,
            worker_id: worker,
            resources: offer.resources,
        };

        match self.fulfil_best_match(&offer, slot) {
            Some(slot) => {
                self.available.lock().insert(
                    slot.slot_id,
                    AvailableSlot {
                        slot,
                        idle_since: Instant::now(),
                    },
                );
            }
            None => {}
        }
        true
    }

    /// Finds the best pending request for `slot`, preferring the request
    /// that holds a matching earmark for this exact allocation; otherwise
    /// the oldest matching request. Binds it and completes its future.
    /// Returns `Some(slot)` (unbound) if nothing matched, so the caller can
    /// place it in `available`.
    fn fulfil_best_match(&self, offer: &SlotOffer, slot: AllocatedSlot) -> Option<AllocatedSlot> {
        let mut pending = self.pending.lock();

        let earmark_holder = pending
            .iter()
            .find(|(_, r)| r.expected_allocation == Some(offer.allocation_id))
            .map(|(id, _)| *id);

        let winner = earmark_holder
            .filter(|id| slot.resources.matches(&pending[id].profile))
            .or_else(|| {
                pending
                    .iter()
                    .filter(|(_, r)| slot.resources.matches(&r.profile))
                    .min_by_key(|(id, _)| id.0)
                    .map(|(id, _)| *id)
            });

        let winner = match winner {
            Some(w) => w,
            None => return Some(slot), // nothing pending matches; caller shelves it.
        };

        // Orphan remapping: someone else held the earmark for this
        // allocation but lost it to `winner`.
        if let Some(holder) = earmark_holder {
            if holder != winner {
                log::debug!(
                    "reassigning orphaned earmark for allocation {}: request {} loses it to {}",
                    offer.allocation_id,
                    holder,
                    winner
                );
                if let Some(req) = pending.get_mut(&holder) {
                    req.expected_allocation = None;
                }
            }
        }

        let req = pending.remove(&winner).unwrap();
        drop(pending);
        self.bind(winner, slot);
        let _ = req.completion.send(Ok(slot));
        None
    }

    /// Releases the slot backing `request_id` (if allocated) or fails the
    /// pending request (if not yet allocated).
    pub fn release_slot(&self, request_id: SlotRequestId, cause: String) {
        if let Some(req) = self.pending.lock().remove(&request_id) {
            let _ = req.completion.send(Err(SlotPoolError::Released(cause)));
            return;
        }

        if let Some(slot) = self.allocated.lock().remove(&request_id) {
            self.allocation_index.lock().remove(&slot.allocation_id);
            if let Some(set) = self.allocated_by_worker.lock().get_mut(&slot.worker_id) {
                set.remove(&request_id);
            }
            // Try to re-fulfil another pending request with this slot,
            // otherwise return it to `available`.
            let offer = SlotOffer {
                slot_id: slot.slot_id,
                allocation_id: slot.allocation_id,
                resources: slot.resources,
            };
            if self.fulfil_best_match(&offer, slot).is_some() {
                self.available.lock().insert(
                    slot.slot_id,
                    AvailableSlot {
                        slot,
                        idle_since: Instant::now(),
                    },
                );
            }
        }
    }

    /// Fails the pending request holding `allocation_id`, or (if already
    /// allocated) frees the slot and notifies the broker.
    pub fn fail_allocation(&self, allocation_id: AllocationId, message: String) {
        if let Some(request_id) = self.allocation_index.lock().get(&allocation_id).copied() {
            if let Some(slot) = self.allocated.lock().remove(&request_id) {
                self.allocation_index.lock().remove(&allocation_id);
                if let Some(set) = self.allocated_by_worker.lock().get_mut(&slot.worker_id) {
                    set.remove(&request_id);
                }
                if let Some(broker) = self.broker.lock().clone() {
                    broker.release_slot(allocation_id);
                }
            }
            return;
        }
        // Might still be pending if the allocation only exists as an
        // earmark that never turned into an offer.
        let pending_holder = self
            .pending
            .lock()
            .iter()
            .find(|(_, r)| r.expected_allocation == Some(allocation_id))
            .map(|(id, _)| *id);
        if let Some(id) = pending_holder {
            if let Some(req) = self.pending.lock().remove(&id) {
                let _ = req.completion.send(Err(SlotPoolError::Released(message)));
            }
        }
    }

    /// Periodic maintenance: returns idle available slots past
    /// `idle_timeout` to the broker, and fails streaming pending requests
    /// past `request_timeout`. `can_be_released` is consulted before
    /// releasing an available slot (e.g. to check in-flight results have
    /// been consumed); it re-reads `idle_since` is implicit since we hold
    /// the lock across the check in this single-threaded scan.
    pub fn scan_idle(&self, can_be_released: impl Fn(SlotId) -> bool) {
        let now = Instant::now();
        let mut to_release = Vec::new();
        {
            let available = self.available.lock();
            for (id, s) in available.iter() {
                if now.duration_since(s.idle_since) >= self.timeouts.idle_timeout {
                    to_release.push(*id);
                }
            }
        }
        for id in to_release {
            if !can_be_released(id) {
                continue;
            }
            let mut available = self.available.lock();
            if let Some(s) = available.get(&id) {
                if now.duration_since(s.idle_since) < self.timeouts.idle_timeout {
                    continue; // reallocated since we scanned; recheck.
                }
            }
            if let Some(s) = available.shift_remove(&id) {
                drop(available);
                if let Some(broker) = self.broker.lock().clone() {
                    broker.release_slot(s.slot.allocation_id);
                }
            }
        }

        let mut timed_out = Vec::new();
        {
            let pending = self.pending.lock();
            for (id, req) in pending.iter() {
                if req.mode == SlotRequestMode::Batch {
                    continue; // batch requests only fail via broker rejection.
                }
                if now.duration_since(req.created_at) >= req.timeout {
                    timed_out.push(*id);
                }
            }
        }
        for id in timed_out {
            if let Some(req) = self.pending.lock().remove(&id) {
                let _ = req.completion.send(Err(SlotPoolError::Timeout));
            }
        }
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingBroker {
        requests: Mutex<Vec<(SlotRequestId, ResourceProfile)>>,
        released: AtomicUsize,
    }

    impl RecordingBroker {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                released: AtomicUsize::new(0),
            }
        }
    }

    impl SlotBroker for RecordingBroker {
        fn request_slot(&self, request_id: SlotRequestId, profile: ResourceProfile) {
            self.requests.lock().push((request_id, profile));
        }
        fn release_slot(&self, _allocation_id: AllocationId) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn profile() -> ResourceProfile {
        ResourceProfile::new(1.0, 1024, 0, 256, 64)
    }

    /// Seed scenario §8.4: pool with no broker stashes a request; once the
    /// broker connects and offers a matching slot, the request completes.
    #[test]
    fn request_then_offer_round_trip() {
        let pool = SlotPool::new(SlotPoolTimeouts::default());
        let r1 = pool.next_request_id();
        let rx = pool.request_new_slot(r1, profile(), SlotRequestMode::Streaming, None);
        assert_eq!(pool.pending_count(), 1);

        let broker = Arc::new(RecordingBroker::new());
        pool.connect_broker(broker.clone());
        assert_eq!(broker.requests.lock().len(), 1);

        pool.register_worker(WorkerId(1));
        let accepted = pool.offer_slot(
            WorkerId(1),
            SlotOffer {
                slot_id: SlotId::new(WorkerId(1), 0),
                allocation_id: AllocationId(100),
                resources: profile(),
            },
        );
        assert!(accepted);

        let result = rx.recv().unwrap().unwrap();
        assert_eq!(result.allocation_id, AllocationId(100));
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn duplicate_offer_is_idempotent() {
        let pool = SlotPool::new(SlotPoolTimeouts::default());
        pool.register_worker(WorkerId(1));
        let offer = SlotOffer {
            slot_id: SlotId::new(WorkerId(1), 0),
            allocation_id: AllocationId(7),
            resources: profile(),
        };
        assert!(pool.offer_slot(WorkerId(1), offer));
        assert!(pool.offer_slot(WorkerId(1), offer));
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn colliding_allocation_different_slot_is_rejected() {
        let pool = SlotPool::new(SlotPoolTimeouts::default());
        pool.register_worker(WorkerId(1));
        let offer1 = SlotOffer {
            slot_id: SlotId::new(WorkerId(1), 0),
            allocation_id: AllocationId(7),
            resources: profile(),
        };
        let offer2 = SlotOffer {
            slot_id: SlotId::new(WorkerId(1), 1),
            allocation_id: AllocationId(7),
            resources: profile(),
        };
        assert!(pool.offer_slot(WorkerId(1), offer1));
        assert!(!pool.offer_slot(WorkerId(1), offer2));
    }

    #[test]
    fn release_worker_frees_its_slots_and_fails_allocated_requests() {
        let pool = SlotPool::new(SlotPoolTimeouts::default());
        pool.register_worker(WorkerId(1));
        let r1 = pool.next_request_id();
        let rx = pool.request_new_slot(r1, profile(), SlotRequestMode::Streaming, None);
        pool.offer_slot(
            WorkerId(1),
            SlotOffer {
                slot_id: SlotId::new(WorkerId(1), 0),
                allocation_id: AllocationId(1),
                resources: profile(),
            },
        );
        rx.recv().unwrap().unwrap();
        assert_eq!(pool.allocated_count(), 1);

        pool.release_worker(WorkerId(1));
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn orphan_remapping_reassigns_stale_earmark() {
        let pool = SlotPool::new(SlotPoolTimeouts::default());
        pool.register_worker(WorkerId(1));

        // r1 is registered first so it gets the lower request id, and asks
        // for a profile the eventual offer will satisfy.
        let r1 = pool.next_request_id();
        let rx1 = pool.request_new_slot(r1, profile(), SlotRequestMode::Streaming, None);

        // r2 holds the earmark for allocation 42, but its own profile no
        // longer fits what gets offered under that allocation — the
        // earmark has gone stale.
        let r2 = pool.next_request_id();
        let outgrown = ResourceProfile::new(8.0, 8192, 0, 2048, 512);
        let rx2 = pool.request_new_slot(r2, outgrown, SlotRequestMode::Streaming, None);
        pool.earmark(r2, AllocationId(42));

        let accepted = pool.offer_slot(
            WorkerId(1),
            SlotOffer {
                slot_id: SlotId::new(WorkerId(1), 0),
                allocation_id: AllocationId(42),
                resources: profile(),
            },
        );
        assert!(accepted);

        // r1 wins the allocation despite never holding its earmark, since
        // it's the oldest request whose profile actually matches.
        let result = rx1.recv().unwrap().unwrap();
        assert_eq!(result.allocation_id, AllocationId(42));

        // r2 is still pending, its stale earmark cleared rather than
        // silently carried forward onto a slot it can't use.
        assert_eq!(pool.pending_count(), 1);
        assert!(rx2.try_recv().is_err());
    }
}
