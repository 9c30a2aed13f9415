//! Checkpoint barrier alignment and tracking.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

pub const TRACKING_HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointType {
    Checkpoint,
    SavepointCanonical,
    SavepointNative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub checkpoint_type_is_checkpoint: bool,
    pub location: Option<String>,
    pub aligned: bool,
    pub alignment_timeout_ms: i64,
    pub unaligned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointBarrier {
    pub id: i64,
    pub timestamp_ms: i64,
    pub options: CheckpointOptions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelCheckpointMarker {
    pub id: i64,
}

/// What the task should do after a barrier arrives on one channel.
#[derive(Debug, PartialEq, Eq)]
pub enum BarrierAction {
    /// Keep reading the channel normally.
    Continue,
    /// Block further delivery on this channel until alignment completes.
    Block,
    /// Every channel has now delivered `id`: snapshot.
    TriggerSnapshot(i64),
    /// Alignment for `id` was aborted by a cancellation marker.
    Abort(i64),
}

/// Unaligned-checkpoint per-channel state, transitioned by barrier
/// announcements (priority path) and actual arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnalignedChannelState {
    Completed,
    Pending,
    Received,
}

pub trait BarrierHandler: Send {
    /// Processes a barrier seen on `channel_index` out of `total_channels`.
    fn on_barrier(&mut self, channel_index: usize, total_channels: usize, barrier_id: i64) -> BarrierAction;
    /// Processes a cancellation marker seen on `channel_index`. A
    /// cancellation for `id` aborts every still-pending entry older than
    /// `id` as well as `id` itself, so the caller may need to act on more
    /// than one aborted barrier.
    fn on_cancel(&mut self, channel_index: usize, id: i64) -> Vec<BarrierAction>;
    /// A channel reached end-of-partition; it counts as having delivered
    /// all future barriers.
    fn on_end_of_partition(&mut self, channel_index: usize, total_channels: usize) -> Option<BarrierAction>;
}

/// Exactly-once: every channel must deliver barrier `b` before the task
/// snapshots; channels that deliver early are blocked until then.
pub struct AligningBarrierHandler {
    current: i64,
    delivered: Vec<bool>,
    delivered_count: usize,
    eop: Vec<bool>,
    aborted_current: bool,
}

impl AligningBarrierHandler {
    pub fn new(total_channels: usize) -> Self {
        Self {
            current: 0,
            delivered: vec![false; total_channels],
            delivered_count: 0,
            eop: vec![false; total_channels],
            aborted_current: false,
        }
    }

    fn reset_for(&mut self, id: i64) {
        self.current = id;
        self.aborted_current = false;
        self.delivered_count = self.eop.iter().filter(|&&e| e).count();
        for (i, d) in self.delivered.iter_mut().enumerate() {
            *d = self.eop[i];
        }
    }
}

impl BarrierHandler for AligningBarrierHandler {
    fn on_barrier(&mut self, channel_index: usize, total_channels: usize, barrier_id: i64) -> BarrierAction {
        if barrier_id < self.current {
            return BarrierAction::Continue; // stale, discard
        }
        if barrier_id > self.current {
            self.reset_for(barrier_id);
        }
        if self.aborted_current {
            return BarrierAction::Continue;
        }
        if !self.delivered[channel_index] {
            self.delivered[channel_index] = true;
            self.delivered_count += 1;
        }
        if self.delivered_count == total_channels {
            BarrierAction::TriggerSnapshot(self.current)
        } else {
            BarrierAction::Block
        }
    }

    fn on_cancel(&mut self, _channel_index: usize, id: i64) -> Vec<BarrierAction> {
        if id < self.current {
            return Vec::new();
        }
        if id > self.current {
            self.reset_for(id);
        }
        if self.aborted_current {
            return Vec::new();
        }
        self.aborted_current = true;
        vec![BarrierAction::Abort(id)]
    }

    fn on_end_of_partition(&mut self, channel_index: usize, total_channels: usize) -> Option<BarrierAction> {
        self.eop[channel_index] = true;
        if !self.delivered[channel_index] {
            self.delivered[channel_index] = true;
            self.delivered_count += 1;
        }
        if !self.aborted_current && self.delivered_count == total_channels {
            Some(BarrierAction::TriggerSnapshot(self.current))
        } else {
            None
        }
    }
}

struct TrackedEntry {
    id: i64,
    count: usize,
    aborted: bool,
}

/// At-least-once: tolerates out-of-order/partial alignment, bounded by a
/// capped history of in-flight barrier ids.
pub struct TrackingBarrierHandler {
    history: VecDeque<TrackedEntry>,
}

impl TrackingBarrierHandler {
    pub fn new() -> Self {
        Self {
            history: VecDeque::new(),
        }
    }

    fn latest_pending(&self) -> Option<i64> {
        self.history.back().map(|e| e.id)
    }

    fn push_capped(&mut self, entry: TrackedEntry) {
        if self.history.len() >= TRACKING_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

impl Default for TrackingBarrierHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierHandler for TrackingBarrierHandler {
    fn on_barrier(&mut self, _channel_index: usize, total_channels: usize, barrier_id: i64) -> BarrierAction {
        if let Some(pos) = self.history.iter().position(|e| e.id == barrier_id) {
            self.history[pos].count += 1;
            let (count, aborted) = {
                let e = &self.history[pos];
                (e.count, e.aborted)
            };
            if count == total_channels && !aborted {
                // Pop this entry and every older one.
                for _ in 0..=pos {
                    self.history.pop_front();
                }
                return BarrierAction::TriggerSnapshot(barrier_id);
            }
            return BarrierAction::Continue;
        }
        if barrier_id > self.latest_pending().unwrap_or(i64::MIN) {
            self.push_capped(TrackedEntry {
                id: barrier_id,
                count: 1,
                aborted: false,
            });
        }
        BarrierAction::Continue
    }

    fn on_cancel(&mut self, _channel_index: usize, id: i64) -> Vec<BarrierAction> {
        // Every entry older than `id` can never complete alignment once
        // `id` is cancelled (a later barrier cancelling means the earlier
        // ones were already subsumed); drop and abort-notify each of them,
        // not just the target.
        let mut actions = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.history.len());
        while let Some(entry) = self.history.pop_front() {
            if entry.id < id {
                actions.push(BarrierAction::Abort(entry.id));
            } else {
                remaining.push_back(entry);
            }
        }
        self.history = remaining;

        if let Some(e) = self.history.iter_mut().find(|e| e.id == id) {
            e.aborted = true;
        } else {
            self.push_capped(TrackedEntry {
                id,
                count: 0,
                aborted: true,
            });
        }
        actions.push(BarrierAction::Abort(id));
        actions
    }

    fn on_end_of_partition(&mut self, _channel_index: usize, _total_channels: usize) -> Option<BarrierAction> {
        None
    }
}

pub fn kind_for_barrier_error() -> ErrorKind {
    ErrorKind::CheckpointDeclined
}
