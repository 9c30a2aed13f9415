//! Shared-slot tree: subdivides one physical slot among the vertices of a
//! slot-sharing group, keyed by co-location constraint.
//!
//! Mirrors the hierarchy renoir's `block::Scheduling`/`Replication` use to
//! express "how many of these may share a host": here a [`MultiSlot`] is the
//! shareable root, and its children are either direct [`SingleSlot`]
//! reservations or nested [`MultiSlot`]s, so a co-location group can itself
//! host another co-location group.

use std::collections::HashMap;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::{AllocationId, BlockId, CoordUInt, SlotId, SubtaskCoord, WorkerId};
use crate::resource::ResourceProfile;

#[derive(Debug, Error, Clone)]
pub enum SharingError {
    #[error("slot-sharing group {0} has no remaining capacity for the requested profile")]
    Oversubscribed(String),
    #[error("co-location group {0} already has a reservation for subtask index {1}")]
    DuplicateCoLocation(String, CoordUInt),
}

impl SharingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SharingError::Oversubscribed(_) => ErrorKind::SlotOccupied,
            SharingError::DuplicateCoLocation(..) => ErrorKind::SlotAllocation,
        }
    }
}

/// One vertex's reservation of a slice of a [`MultiSlot`].
#[derive(Debug, Clone)]
pub struct SingleSlot {
    pub block: BlockId,
    pub subtask: SubtaskCoord,
    pub reserved: ResourceProfile,
}

/// A child of a [`MultiSlot`]: either a direct vertex reservation, or a
/// nested sharing group carved out of this one.
enum SharingChild {
    Leaf(SingleSlot),
    Nested(Box<MultiSlot>),
}

impl SharingChild {
    fn reserved(&self) -> ResourceProfile {
        match self {
            SharingChild::Leaf(s) => s.reserved,
            SharingChild::Nested(m) => m.reserved(),
        }
    }
}

/// The physical slot a root [`MultiSlot`] has been bound to, once the
/// broker actually offers one.
#[derive(Debug, Clone, Copy)]
struct ResolvedSlot {
    slot_id: SlotId,
    location: WorkerId,
}

/// A slot-sharing group: a tree whose root is either unresolved (still
/// waiting to be bound to a physical [`SlotId`]) or bound, and whose
/// children are vertex reservations or further nested groups. Only the
/// resolved capacity is ever enforced against; an unresolved root tracks
/// reservations against its *expected* capacity so a group can be built up
/// before a slot is actually offered.
pub struct MultiSlot {
    pub sharing_group: String,
    expected_capacity: ResourceProfile,
    resolved: Option<ResolvedSlot>,
    children: Vec<SharingChild>,
    /// `co_location_key -> subtask_index` already reserved, so a second
    /// attempt to co-locate the same index is rejected.
    co_location_claims: HashMap<String, CoordUInt>,
}

impl MultiSlot {
    /// Creates a root not yet bound to a physical slot, tracking
    /// reservations against `expected_capacity` until [`Self::resolve`]
    /// binds it to the slot the broker actually offered.
    pub fn new_unresolved(sharing_group: String, expected_capacity: ResourceProfile) -> Self {
        Self {
            sharing_group,
            expected_capacity,
            resolved: None,
            children: Vec::new(),
            co_location_claims: HashMap::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn slot_id(&self) -> Option<SlotId> {
        self.resolved.map(|r| r.slot_id)
    }

    pub fn location(&self) -> Option<WorkerId> {
        self.resolved.map(|r| r.location)
    }

    pub fn reserved(&self) -> ResourceProfile {
        self.children
            .iter()
            .fold(ResourceProfile::ZERO, |acc, c| acc.merge(&c.reserved()))
    }

    pub fn remaining(&self) -> ResourceProfile {
        self.expected_capacity.subtract(&self.reserved())
    }

    /// Carves out a reservation for `subtask` needing `profile`, optionally
    /// under `co_location_key`. Rejects if the group lacks remaining
    /// capacity, or if `co_location_key` is already claimed by a different
    /// subtask index.
    pub fn reserve(
        &mut self,
        block: BlockId,
        subtask: SubtaskCoord,
        profile: ResourceProfile,
        co_location_key: Option<&str>,
    ) -> Result<(), SharingError> {
        if !self.remaining().matches(&profile) {
            return Err(SharingError::Oversubscribed(self.sharing_group.clone()));
        }
        self.claim_co_location(subtask, co_location_key)?;
        self.children.push(SharingChild::Leaf(SingleSlot {
            block,
            subtask,
            reserved: profile,
        }));
        Ok(())
    }

    /// Nests another sharing group as a child of this one, e.g. a
    /// co-location group embedded inside a broader slot-sharing group.
    /// Rejected the same way a leaf reservation is if `nested`'s own
    /// reserved footprint no longer fits this group's remaining capacity.
    pub fn reserve_nested(&mut self, nested: MultiSlot) -> Result<(), SharingError> {
        if !self.remaining().matches(&nested.reserved()) {
            return Err(SharingError::Oversubscribed(self.sharing_group.clone()));
        }
        self.children.push(SharingChild::Nested(Box::new(nested)));
        Ok(())
    }

    fn claim_co_location(
        &mut self,
        subtask: SubtaskCoord,
        co_location_key: Option<&str>,
    ) -> Result<(), SharingError> {
        let Some(key) = co_location_key else {
            return Ok(());
        };
        if let Some(&claimed) = self.co_location_claims.get(key) {
            if claimed != subtask.subtask_index {
                return Err(SharingError::DuplicateCoLocation(key.to_string(), claimed));
            }
        } else {
            self.co_location_claims
                .insert(key.to_string(), subtask.subtask_index);
        }
        Ok(())
    }

    /// Binds this (so far unresolved) root to the physical slot the broker
    /// offered. If `actual`'s capacity no longer covers what's already been
    /// reserved, the whole root fails: every leaf across the entire tree is
    /// returned as oversubscribed rather than checking capacity leaf by
    /// leaf.
    pub fn resolve(
        &mut self,
        slot_id: SlotId,
        location: WorkerId,
        actual: ResourceProfile,
    ) -> Result<(), Vec<SingleSlot>> {
        if !actual.matches(&self.reserved()) {
            return Err(self.all_leaves());
        }
        self.resolved = Some(ResolvedSlot { slot_id, location });
        self.expected_capacity = actual;
        Ok(())
    }

    /// Every leaf reservation in this tree, recursing into nested groups.
    fn all_leaves(&self) -> Vec<SingleSlot> {
        let mut out = Vec::new();
        for child in &self.children {
            match child {
                SharingChild::Leaf(s) => out.push(s.clone()),
                SharingChild::Nested(m) => out.extend(m.all_leaves()),
            }
        }
        out
    }

    /// Releases every reservation belonging to `subtask`, freeing capacity
    /// and any co-location claim it held, recursing into nested groups and
    /// pruning any that end up empty.
    pub fn release(&mut self, subtask: SubtaskCoord) {
        for child in self.children.iter_mut() {
            if let SharingChild::Nested(m) = child {
                m.release(subtask);
            }
        }
        self.children.retain(|c| match c {
            SharingChild::Leaf(s) => s.subtask != subtask,
            SharingChild::Nested(m) => !m.is_empty(),
        });
        self.co_location_claims
            .retain(|_, &mut index| index != subtask.subtask_index);
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// All direct or nested vertex reservations in this tree.
    pub fn leaves(&self) -> Vec<SingleSlot> {
        self.all_leaves()
    }
}

/// Indexes resolved sharing-group roots by `(worker location, allocation)`
/// so a later vertex asking "is there already a sharing group on this
/// allocation I can join" doesn't need to scan every open group.
#[derive(Default)]
pub struct LocalityIndex {
    by_location: HashMap<(WorkerId, AllocationId), String>,
}

impl LocalityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&mut self, location: WorkerId, allocation_id: AllocationId, sharing_group: String) {
        self.by_location.insert((location, allocation_id), sharing_group);
    }

    pub fn lookup(&self, location: WorkerId, allocation_id: AllocationId) -> Option<&str> {
        self.by_location
            .get(&(location, allocation_id))
            .map(|s| s.as_str())
    }

    pub fn remove(&mut self, location: WorkerId, allocation_id: AllocationId) {
        self.by_location.remove(&(location, allocation_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorkerId;

    fn profile(cpu: f64) -> ResourceProfile {
        ResourceProfile::new(cpu, 1024, 0, 256, 64)
    }

    fn subtask(block: u64, index: u64) -> SubtaskCoord {
        SubtaskCoord {
            block_id: BlockId(block),
            subtask_index: index,
        }
    }

    #[test]
    fn reservations_fit_within_expected_capacity() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(2.0));
        assert!(multi
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), None)
            .is_ok());
        assert!(multi
            .reserve(BlockId(2), subtask(2, 0), profile(1.0), None)
            .is_ok());
        assert!(multi
            .reserve(BlockId(3), subtask(3, 0), profile(0.5), None)
            .is_err());
    }

    #[test]
    fn co_location_key_rejects_a_second_distinct_subtask_index() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(4.0));
        multi
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), Some("colo-a"))
            .unwrap();
        let err = multi
            .reserve(BlockId(2), subtask(2, 1), profile(1.0), Some("colo-a"))
            .unwrap_err();
        assert!(matches!(err, SharingError::DuplicateCoLocation(..)));
    }

    #[test]
    fn same_subtask_index_can_repeat_a_co_location_key() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(4.0));
        multi
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), Some("colo-a"))
            .unwrap();
        assert!(multi
            .reserve(BlockId(2), subtask(2, 0), profile(1.0), Some("colo-a"))
            .is_ok());
    }

    #[test]
    fn release_frees_capacity_and_co_location_claim() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(1.0));
        multi
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), Some("colo-a"))
            .unwrap();
        multi.release(subtask(1, 0));
        assert!(multi.is_empty());
        assert!(multi
            .reserve(BlockId(2), subtask(2, 1), profile(1.0), Some("colo-a"))
            .is_ok());
    }

    #[test]
    fn resolve_binds_the_root_once_actual_capacity_covers_reservations() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(2.0));
        multi
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), None)
            .unwrap();
        assert!(!multi.is_resolved());
        multi
            .resolve(SlotId::new(WorkerId(1), 0), WorkerId(1), profile(2.0))
            .unwrap();
        assert!(multi.is_resolved());
        assert_eq!(multi.location(), Some(WorkerId(1)));
    }

    #[test]
    fn resolve_fails_the_whole_tree_on_oversubscription() {
        let mut multi = MultiSlot::new_unresolved("g".into(), profile(4.0));
        multi
            .reserve(BlockId(1), subtask(1, 0), profile(2.0), None)
            .unwrap();
        multi
            .reserve(BlockId(2), subtask(2, 0), profile(2.0), None)
            .unwrap();
        let failed = multi
            .resolve(SlotId::new(WorkerId(1), 0), WorkerId(1), profile(3.0))
            .unwrap_err();
        assert_eq!(failed.len(), 2);
        assert!(!multi.is_resolved());
    }

    #[test]
    fn nested_groups_contribute_to_the_parent_reserved_footprint() {
        let mut inner = MultiSlot::new_unresolved("inner".into(), profile(2.0));
        inner
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), None)
            .unwrap();

        let mut outer = MultiSlot::new_unresolved("outer".into(), profile(3.0));
        outer.reserve_nested(inner).unwrap();
        assert_eq!(outer.reserved().cpu_cores, 1.0);

        let leaves = outer.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].subtask, subtask(1, 0));
    }

    #[test]
    fn releasing_a_subtask_prunes_an_emptied_nested_group() {
        let mut inner = MultiSlot::new_unresolved("inner".into(), profile(2.0));
        inner
            .reserve(BlockId(1), subtask(1, 0), profile(1.0), None)
            .unwrap();

        let mut outer = MultiSlot::new_unresolved("outer".into(), profile(3.0));
        outer.reserve_nested(inner).unwrap();
        assert!(outer.leaves().iter().any(|l| l.subtask == subtask(1, 0)));

        outer.release(subtask(1, 0));
        assert!(outer.is_empty());
    }

    #[test]
    fn locality_index_finds_the_sharing_group_for_a_resolved_allocation() {
        let mut index = LocalityIndex::new();
        index.index(WorkerId(1), AllocationId(7), "g".into());
        assert_eq!(index.lookup(WorkerId(1), AllocationId(7)), Some("g"));
        assert_eq!(index.lookup(WorkerId(1), AllocationId(8)), None);
        index.remove(WorkerId(1), AllocationId(7));
        assert_eq!(index.lookup(WorkerId(1), AllocationId(7)), None);
    }
}
