//! Per-channel state persister for unaligned checkpoints.

use thiserror::Error;

use crate::error::ErrorKind;
use crate::shuffle::buffer::{Buffer, DataType};
use crate::shuffle::channel::ChannelInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterState {
    Completed,
    Pending,
    Received,
}

#[derive(Debug, Error, Clone)]
pub enum PersisterError {
    #[error("checkpoint {0} is subsumed by a newer barrier already received")]
    CheckpointSubsumed(i64),
}

impl PersisterError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CheckpointSubsumed
    }
}

/// Something that can durably record channel state entries keyed by
/// `(barrier_id, channel_info)`; the on-disk state backend is an external
/// collaborator, so production code wires a concrete
/// writer in and tests use an in-memory double.
pub trait ChannelStateWriter: Send {
    fn write(&mut self, barrier_id: i64, channel: ChannelInfo, buffer: Buffer);
}

/// Tracks one channel's unaligned-checkpoint persistence state machine:
/// `COMPLETED -> PENDING -> RECEIVED -> COMPLETED`.
pub struct ChannelStatePersister {
    channel: ChannelInfo,
    state: PersisterState,
    last_seen: i64,
}

impl ChannelStatePersister {
    pub fn new(channel: ChannelInfo) -> Self {
        Self {
            channel,
            state: PersisterState::Completed,
            last_seen: 0,
        }
    }

    pub fn state(&self) -> PersisterState {
        self.state
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Begins persisting `barrier_id`'s channel state, enqueuing
    /// `known_buffers` to `writer` immediately. Rejects if a newer barrier
    /// has already been RECEIVED.
    pub fn start_persisting(
        &mut self,
        barrier_id: i64,
        known_buffers: Vec<Buffer>,
        writer: &mut dyn ChannelStateWriter,
    ) -> Result<(), PersisterError> {
        if self.state == PersisterState::Received && barrier_id < self.last_seen {
            return Err(PersisterError::CheckpointSubsumed(barrier_id));
        }
        self.state = PersisterState::Pending;
        self.last_seen = self.last_seen.max(barrier_id);
        for buffer in known_buffers {
            writer.write(barrier_id, self.channel, buffer);
        }
        Ok(())
    }

    /// Completes persistence for `id`, returning to COMPLETED if `id` is at
    /// least the last-seen barrier.
    pub fn stop_persisting(&mut self, id: i64) {
        if id >= self.last_seen {
            self.state = PersisterState::Completed;
            self.last_seen = self.last_seen.max(id);
        }
    }

    /// While PENDING, forwards a retained copy of a data buffer to the
    /// writer keyed by the in-flight barrier. No-op for event buffers or
    /// outside the PENDING state.
    pub fn maybe_persist(
        &mut self,
        barrier_id: i64,
        data_type: DataType,
        buffer: &Buffer,
        writer: &mut dyn ChannelStateWriter,
    ) {
        if self.state == PersisterState::Pending && data_type == DataType::Data {
            writer.write(barrier_id, self.channel, buffer.clone());
        }
    }

    /// Inspects a priority event; if it carries a checkpoint barrier with
    /// id at least `expected` (last-seen+1 when COMPLETED, else last-seen),
    /// transitions to RECEIVED. Smaller ids are ignored. Returns whether
    /// the transition happened.
    pub fn check_for_barrier(&mut self, barrier_id: i64) -> bool {
        let expected = if self.state == PersisterState::Completed {
            self.last_seen + 1
        } else {
            self.last_seen
        };
        if barrier_id < expected {
            return false;
        }
        self.state = PersisterState::Received;
        self.last_seen = barrier_id;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<(i64, ChannelInfo)>,
    }

    impl ChannelStateWriter for RecordingWriter {
        fn write(&mut self, barrier_id: i64, channel: ChannelInfo, _buffer: Buffer) {
            self.writes.push((barrier_id, channel));
        }
    }

    fn info() -> ChannelInfo {
        ChannelInfo { gate_index: 0, channel_index: 0 }
    }

    #[test]
    fn start_persisting_enqueues_known_buffers() {
        let mut p = ChannelStatePersister::new(info());
        let mut writer = RecordingWriter::default();
        p.start_persisting(1, vec![Buffer::unpooled(vec![1]), Buffer::unpooled(vec![2])], &mut writer)
            .unwrap();
        assert_eq!(p.state(), PersisterState::Pending);
        assert_eq!(writer.writes.len(), 2);
    }

    #[test]
    fn maybe_persist_only_while_pending_and_only_for_data() {
        let mut p = ChannelStatePersister::new(info());
        let mut writer = RecordingWriter::default();
        p.maybe_persist(1, DataType::Data, &Buffer::unpooled(vec![9]), &mut writer);
        assert!(writer.writes.is_empty(), "not pending yet");

        p.start_persisting(1, vec![], &mut writer).unwrap();
        p.maybe_persist(1, DataType::Event, &Buffer::unpooled(vec![9]), &mut writer);
        assert!(writer.writes.is_empty(), "events are never persisted");

        p.maybe_persist(1, DataType::Data, &Buffer::unpooled(vec![9]), &mut writer);
        assert_eq!(writer.writes.len(), 1);
    }

    #[test]
    fn check_for_barrier_transitions_to_received_and_ignores_smaller_ids() {
        let mut p = ChannelStatePersister::new(info());
        assert!(p.check_for_barrier(1));
        assert_eq!(p.state(), PersisterState::Received);
        assert!(!p.check_for_barrier(0));
    }

    #[test]
    fn stop_persisting_returns_to_completed() {
        let mut p = ChannelStatePersister::new(info());
        let mut writer = RecordingWriter::default();
        p.start_persisting(1, vec![], &mut writer).unwrap();
        p.stop_persisting(1);
        assert_eq!(p.state(), PersisterState::Completed);
    }

    #[test]
    fn subsumed_start_is_rejected() {
        let mut p = ChannelStatePersister::new(info());
        assert!(p.check_for_barrier(5));
        let mut writer = RecordingWriter::default();
        let err = p.start_persisting(3, vec![], &mut writer).unwrap_err();
        assert!(matches!(err, PersisterError::CheckpointSubsumed(3)));
    }
}
