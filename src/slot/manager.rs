//! Cluster-wide slot manager.
//!
//! Tracks every registered worker's advertised slots and the outstanding
//! requests forwarded to it by per-job [`crate::slot::pool::SlotPool`]s,
//! picking a worker for each request and issuing the allocation. Mirrors
//! renoir's `config.rs` habit of keeping one `Mutex`-guarded registry per
//! concern rather than a single god-struct lock.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use coarsetime::Instant;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ResourceActions, SlotManagerConfig};
use crate::error::ErrorKind;
use crate::ids::{AllocationId, CoordUInt, IdGenerator, SlotId, SlotIndex, SlotRequestId, WorkerId};
use crate::resource::ResourceProfile;

#[derive(Debug, Error, Clone)]
pub enum SlotManagerError {
    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
    #[error("no worker currently offers a slot matching the requested profile")]
    Unfulfillable,
    #[error("slot {0} is already allocated")]
    SlotOccupied(SlotId),
    #[error("registering this worker would exceed the cluster's max_slots budget")]
    ClusterCapacityExceeded,
}

impl SlotManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlotManagerError::UnknownWorker(_) => ErrorKind::NoResource,
            SlotManagerError::Unfulfillable => ErrorKind::UnfulfillableSlotRequest,
            SlotManagerError::SlotOccupied(_) => ErrorKind::SlotOccupied,
            SlotManagerError::ClusterCapacityExceeded => ErrorKind::NoResource,
        }
    }
}

/// One worker's advertised slot inventory, as last reported via heartbeat.
#[derive(Debug, Clone)]
struct WorkerSlots {
    total_slots: SlotIndex,
    free: HashSet<SlotIndex>,
    allocated: HashMap<SlotIndex, AllocationId>,
    profile_per_slot: ResourceProfile,
}

/// A request waiting for the manager to find or free a matching slot.
struct PendingRequest {
    job: SlotRequestId,
    profile: ResourceProfile,
}

/// The other half of a [`crate::slot::pool::SlotBroker`]: receives the
/// requests the manager allocates and must be told which job to offer the
/// resulting slot to. Implemented by whatever RPC/runtime layer drives
/// worker communication; out of scope here.
pub trait SlotAllocationSink: Send + Sync {
    fn allocation_succeeded(
        &self,
        job: SlotRequestId,
        worker: WorkerId,
        slot_id: SlotId,
        allocation_id: AllocationId,
        resources: ResourceProfile,
    );
    fn allocation_failed(&self, job: SlotRequestId, error: SlotManagerError);
}

/// Cluster-wide registry of worker slot inventories and the allocator that
/// matches pending requests against them.
pub struct SlotManager {
    workers: Mutex<HashMap<WorkerId, WorkerSlots>>,
    pending: Mutex<Vec<PendingRequest>>,
    allocation_owner: Mutex<HashMap<AllocationId, (WorkerId, SlotIndex)>>,
    /// Requests for which a worker launch has already been requested from
    /// `ResourceActions`; holds the profile the incoming worker is expected
    /// to satisfy so it jumps the retry queue ahead of requests nobody is
    /// growing the cluster for.
    pending_worker_slots: Mutex<HashMap<SlotRequestId, ResourceProfile>>,
    last_heartbeat: Mutex<HashMap<WorkerId, Instant>>,
    pending_since: Mutex<HashMap<SlotRequestId, Instant>>,
    max_slots: CoordUInt,
    worker_timeout: Duration,
    slot_request_timeout: Duration,
    ids: IdGenerator,
}

impl SlotManager {
    pub fn new(config: &SlotManagerConfig) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            allocation_owner: Mutex::new(HashMap::new()),
            pending_worker_slots: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(HashMap::new()),
            pending_since: Mutex::new(HashMap::new()),
            max_slots: config.max_slots,
            worker_timeout: config.worker_timeout(),
            slot_request_timeout: config.slot_request_timeout(),
            ids: IdGenerator::new(),
        }
    }

    pub fn next_allocation_id(&self) -> AllocationId {
        AllocationId(self.ids.next())
    }

    /// Registers (or re-registers) a worker with `total_slots` identical
    /// slots, each able to host `profile_per_slot`. Rejects the worker (and
    /// asks `actions` to release it again) if doing so would push the
    /// cluster's total slot count past `max_slots`.
    pub fn register_worker(
        &self,
        worker: WorkerId,
        total_slots: SlotIndex,
        profile_per_slot: ResourceProfile,
        sink: &dyn SlotAllocationSink,
        actions: &dyn ResourceActions,
    ) -> Result<(), SlotManagerError> {
        let prospective_total: CoordUInt = {
            let workers = self.workers.lock();
            workers
                .iter()
                .filter(|(w, _)| **w != worker)
                .map(|(_, s)| s.total_slots as CoordUInt)
                .sum::<CoordUInt>()
                + total_slots as CoordUInt
        };
        if prospective_total > self.max_slots {
            actions.release_worker(worker);
            return Err(SlotManagerError::ClusterCapacityExceeded);
        }

        let free: HashSet<SlotIndex> = (0..total_slots).collect();
        self.workers.lock().insert(
            worker,
            WorkerSlots {
                total_slots,
                free,
                allocated: HashMap::new(),
                profile_per_slot,
            },
        );
        self.last_heartbeat.lock().insert(worker, Instant::now());
        log::info!("worker {worker} registered with {total_slots} slots");
        self.retry_pending(sink);
        Ok(())
    }

    /// Refreshes the liveness timestamp used by [`Self::scan_idle`].
    pub fn heartbeat(&self, worker: WorkerId) {
        self.last_heartbeat.lock().insert(worker, Instant::now());
    }

    /// Drops a worker entirely; every allocation it held is implicitly
    /// lost (the owning job's slot pool learns this separately via
    /// `release_worker`).
    pub fn unregister_worker(&self, worker: WorkerId) {
        self.workers.lock().remove(&worker);
        self.allocation_owner
            .lock()
            .retain(|_, (w, _)| *w != worker);
        self.last_heartbeat.lock().remove(&worker);
    }

    /// Registers a slot request and immediately tries to satisfy it,
    /// notifying `sink` synchronously either way. Unsatisfiable requests are
    /// queued, and a new worker is requested via `actions` on their behalf,
    /// and retried whenever a slot frees up or a worker registers.
    pub fn register_slot_request(
        &self,
        job: SlotRequestId,
        profile: ResourceProfile,
        sink: &dyn SlotAllocationSink,
        actions: &dyn ResourceActions,
    ) {
        if let Some((worker, index, allocation_id)) = self.try_allocate(&profile) {
            let resources = self.workers.lock()[&worker].profile_per_slot;
            let slot_id = SlotId::new(worker, index);
            sink.allocation_succeeded(job, worker, slot_id, allocation_id, resources);
        } else {
            self.pending.lock().push(PendingRequest { job, profile });
            self.pending_since.lock().insert(job, Instant::now());
            self.pending_worker_slots.lock().insert(job, profile);
            actions.launch_worker(1);
        }
    }

    fn try_allocate(
        &self,
        profile: &ResourceProfile,
    ) -> Option<(WorkerId, SlotIndex, AllocationId)> {
        let mut workers = self.workers.lock();
        // Smallest worker-id first for determinism, mirroring the graph
        // compiler's sort-before-iterate discipline.
        let mut ids: Vec<WorkerId> = workers.keys().copied().collect();
        ids.sort();
        for worker in ids {
            let slots = workers.get_mut(&worker).unwrap();
            if !slots.profile_per_slot.matches(profile) {
                continue;
            }
            let mut free: Vec<SlotIndex> = slots.free.iter().copied().collect();
            free.sort();
            if let Some(&index) = free.first() {
                slots.free.remove(&index);
                let allocation_id = self.next_allocation_id();
                slots.allocated.insert(index, allocation_id);
                self.allocation_owner
                    .lock()
                    .insert(allocation_id, (worker, index));
                return Some((worker, index, allocation_id));
            }
        }
        None
    }

    /// Frees a previously allocated slot and retries the pending-request
    /// queue in FIFO order, since a freed slot may now satisfy a request
    /// that has been waiting the longest.
    pub fn free_slot(&self, allocation_id: AllocationId) {
        let owner = self.allocation_owner.lock().remove(&allocation_id);
        let Some((worker, index)) = owner else {
            return;
        };
        if let Some(slots) = self.workers.lock().get_mut(&worker) {
            slots.allocated.remove(&index);
            slots.free.insert(index);
        }
        log::debug!("allocation {allocation_id} freed on worker {worker}");
    }

    /// Re-attempts every queued request against current free capacity.
    /// Callers invoke this after `free_slot` or worker registration; takes
    /// a sink to notify newly satisfied requests. Requests a worker launch
    /// was already requested for are tried first, since the newly freed or
    /// registered capacity is most likely the one they were waiting on.
    pub fn retry_pending(&self, sink: &dyn SlotAllocationSink) {
        let mut pending: Vec<PendingRequest> = {
            let mut guard = self.pending.lock();
            std::mem::take(&mut *guard)
        };
        let awaiting_worker = self.pending_worker_slots.lock();
        pending.sort_by_key(|req| !awaiting_worker.contains_key(&req.job));
        drop(awaiting_worker);

        let mut still_pending = Vec::new();
        for req in pending {
            match self.try_allocate(&req.profile) {
                Some((worker, index, allocation_id)) => {
                    let resources = self.workers.lock()[&worker].profile_per_slot;
                    let slot_id = SlotId::new(worker, index);
                    self.pending_worker_slots.lock().remove(&req.job);
                    self.pending_since.lock().remove(&req.job);
                    sink.allocation_succeeded(req.job, worker, slot_id, allocation_id, resources);
                }
                None => still_pending.push(req),
            }
        }
        *self.pending.lock() = still_pending;
    }

    /// Declares a request permanently unfulfillable (e.g. its profile
    /// exceeds every registered worker's capacity) and removes it from the
    /// queue, notifying `sink`.
    pub fn declare_unfulfillable(&self, job: SlotRequestId, sink: &dyn SlotAllocationSink) {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|r| r.job == job) {
            pending.remove(pos);
            drop(pending);
            self.pending_worker_slots.lock().remove(&job);
            self.pending_since.lock().remove(&job);
            sink.allocation_failed(job, SlotManagerError::Unfulfillable);
        }
    }

    /// Periodic maintenance: releases workers that have missed
    /// heartbeats past `worker_timeout`, and fails pending requests that
    /// have waited past `slot_request_timeout` without a worker ever
    /// satisfying them.
    pub fn scan_idle(&self, sink: &dyn SlotAllocationSink, actions: &dyn ResourceActions) {
        let now = Instant::now();
        let stale_workers: Vec<WorkerId> = {
            let heartbeats = self.last_heartbeat.lock();
            heartbeats
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) >= self.worker_timeout)
                .map(|(w, _)| *w)
                .collect()
        };
        for worker in stale_workers {
            self.unregister_worker(worker);
            actions.release_worker(worker);
            log::warn!("worker {worker} missed its heartbeat deadline, releasing it");
        }

        let timed_out: Vec<SlotRequestId> = {
            let pending_since = self.pending_since.lock();
            pending_since
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= self.slot_request_timeout)
                .map(|(job, _)| *job)
                .collect()
        };
        for job in timed_out {
            let mut pending = self.pending.lock();
            if let Some(pos) = pending.iter().position(|r| r.job == job) {
                pending.remove(pos);
                drop(pending);
                self.pending_worker_slots.lock().remove(&job);
                self.pending_since.lock().remove(&job);
                sink.allocation_failed(job, SlotManagerError::Unfulfillable);
            }
        }
    }

    pub fn total_slots(&self, worker: WorkerId) -> Option<SlotIndex> {
        self.workers.lock().get(&worker).map(|w| w.total_slots)
    }

    pub fn free_slot_count(&self, worker: WorkerId) -> Option<usize> {
        self.workers.lock().get(&worker).map(|w| w.free.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for SlotManager {
    fn default() -> Self {
        Self::new(&SlotManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        successes: StdMutex<Vec<(SlotRequestId, WorkerId)>>,
        failures: StdMutex<Vec<SlotRequestId>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                successes: StdMutex::new(Vec::new()),
                failures: StdMutex::new(Vec::new()),
            }
        }
    }

    impl SlotAllocationSink for RecordingSink {
        fn allocation_succeeded(
            &self,
            job: SlotRequestId,
            worker: WorkerId,
            _slot_id: SlotId,
            _allocation_id: AllocationId,
            _resources: ResourceProfile,
        ) {
            self.successes.lock().unwrap().push((job, worker));
        }
        fn allocation_failed(&self, job: SlotRequestId, _error: SlotManagerError) {
            self.failures.lock().unwrap().push(job);
        }
    }

    #[derive(Default)]
    struct RecordingActions {
        launches: StdMutex<Vec<CoordUInt>>,
        releases: StdMutex<Vec<WorkerId>>,
    }

    impl ResourceActions for RecordingActions {
        fn launch_worker(&self, slots_per_worker: CoordUInt) {
            self.launches.lock().unwrap().push(slots_per_worker);
        }
        fn release_worker(&self, worker: WorkerId) {
            self.releases.lock().unwrap().push(worker);
        }
    }

    fn profile() -> ResourceProfile {
        ResourceProfile::new(1.0, 1024, 0, 256, 64)
    }

    fn manager_with(max_slots: CoordUInt) -> SlotManager {
        SlotManager::new(&SlotManagerConfig {
            max_slots,
            ..SlotManagerConfig::default()
        })
    }

    #[test]
    fn request_is_satisfied_from_a_registered_worker() {
        let manager = manager_with(1024);
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 2, profile(), &sink, &actions).unwrap();
        manager.register_slot_request(SlotRequestId(1), profile(), &sink, &actions);
        assert_eq!(sink.successes.lock().unwrap().len(), 1);
        assert_eq!(manager.free_slot_count(WorkerId(1)), Some(1));
    }

    #[test]
    fn exhausted_capacity_queues_the_request_and_asks_for_a_worker() {
        let manager = manager_with(1024);
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 1, profile(), &sink, &actions).unwrap();
        manager.register_slot_request(SlotRequestId(1), profile(), &sink, &actions);
        manager.register_slot_request(SlotRequestId(2), profile(), &sink, &actions);
        assert_eq!(sink.successes.lock().unwrap().len(), 1);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(actions.launches.lock().unwrap().len(), 1);
    }

    #[test]
    fn freeing_a_slot_unblocks_the_oldest_pending_request() {
        let manager = manager_with(1024);
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 1, profile(), &sink, &actions).unwrap();
        manager.register_slot_request(SlotRequestId(1), profile(), &sink, &actions);
        manager.register_slot_request(SlotRequestId(2), profile(), &sink, &actions);

        let allocation_id = {
            let workers = manager.workers.lock();
            *workers[&WorkerId(1)].allocated.values().next().unwrap()
        };
        manager.free_slot(allocation_id);
        manager.retry_pending(&sink);

        assert_eq!(sink.successes.lock().unwrap().len(), 2);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn unregistering_a_worker_drops_its_allocations() {
        let manager = manager_with(1024);
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 1, profile(), &sink, &actions).unwrap();
        manager.register_slot_request(SlotRequestId(1), profile(), &sink, &actions);
        manager.unregister_worker(WorkerId(1));
        assert_eq!(manager.total_slots(WorkerId(1)), None);
    }

    #[test]
    fn registering_past_max_slots_is_rejected_and_releases_the_worker() {
        let manager = manager_with(1);
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 1, profile(), &sink, &actions).unwrap();
        let result = manager.register_worker(WorkerId(2), 1, profile(), &sink, &actions);
        assert!(matches!(result, Err(SlotManagerError::ClusterCapacityExceeded)));
        assert_eq!(actions.releases.lock().unwrap(), vec![WorkerId(2)]);
        assert_eq!(manager.total_slots(WorkerId(2)), None);
    }

    #[test]
    fn scan_idle_releases_stale_workers_and_fails_stale_requests() {
        let manager = SlotManager::new(&SlotManagerConfig {
            worker_timeout_secs: 0,
            slot_request_timeout_secs: 0,
            ..SlotManagerConfig::default()
        });
        let sink = RecordingSink::new();
        let actions = RecordingActions::default();
        manager.register_worker(WorkerId(1), 1, profile(), &sink, &actions).unwrap();
        manager.register_slot_request(SlotRequestId(1), profile(), &sink, &actions);
        manager.register_slot_request(SlotRequestId(2), profile(), &sink, &actions);

        std::thread::sleep(Duration::from_millis(5));
        manager.scan_idle(&sink, &actions);

        assert!(actions.releases.lock().unwrap().contains(&WorkerId(1)));
        assert_eq!(manager.total_slots(WorkerId(1)), None);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(sink.failures.lock().unwrap().len(), 1);
    }
}
