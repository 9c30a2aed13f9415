//! In-process partition registry and the local channel variant that reads
//! through it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::shuffle::buffer::{Buffer, DataType};
use crate::shuffle::channel::{BufferAndBacklog, ChannelError, ChannelInfo, InputChannel, PartitionId};

/// One subpartition of a local (same-process) producer's result, as seen
/// by a consuming channel.
pub trait ResultSubpartitionView: Send + Sync {
    /// Pops the next buffer, or `None` if currently empty (not finished).
    fn poll_next(&self) -> Option<BufferAndBacklog>;
    /// Registers a callback invoked once more data becomes available after
    /// an empty `poll_next`. At most one listener is kept; a new
    /// registration replaces the old one.
    fn register_listener(&self, notify: Arc<dyn Fn() + Send + Sync>);
    fn is_finished(&self) -> bool;
}

/// Maps partition ids to their local subpartition views, populated by the
/// task that owns the producing result partition and consulted by every
/// local consumer channel in the same process.
#[derive(Default)]
pub struct PartitionRegistry {
    partitions: Mutex<HashMap<PartitionId, Vec<Arc<dyn ResultSubpartitionView>>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: PartitionId, subpartitions: Vec<Arc<dyn ResultSubpartitionView>>) {
        self.partitions.lock().insert(partition, subpartitions);
    }

    pub fn unregister(&self, partition: PartitionId) {
        self.partitions.lock().remove(&partition);
    }

    fn subpartition(
        &self,
        partition: PartitionId,
        index: u32,
    ) -> Option<Arc<dyn ResultSubpartitionView>> {
        self.partitions
            .lock()
            .get(&partition)
            .and_then(|views| views.get(index as usize).cloned())
    }
}

/// Consumes one local subpartition directly in-process, bypassing the
/// shuffle transport entirely.
pub struct LocalInputChannel {
    info: ChannelInfo,
    registry: Arc<PartitionRegistry>,
    partition_id: PartitionId,
    subpartition_index: u32,
    view: Option<Arc<dyn ResultSubpartitionView>>,
    sequence_number: u32,
    released: bool,
}

impl LocalInputChannel {
    pub fn new(
        info: ChannelInfo,
        registry: Arc<PartitionRegistry>,
        partition_id: PartitionId,
        subpartition_index: u32,
    ) -> Self {
        Self {
            info,
            registry,
            partition_id,
            subpartition_index,
            view: None,
            sequence_number: 0,
            released: false,
        }
    }
}

impl InputChannel for LocalInputChannel {
    fn channel_info(&self) -> ChannelInfo {
        self.info
    }

    fn request_subpartition(&mut self) -> Result<(), ChannelError> {
        let view = self
            .registry
            .subpartition(self.partition_id, self.subpartition_index)
            .ok_or(ChannelError::PartitionNotFound(self.partition_id))?;
        self.view = Some(view);
        Ok(())
    }

    fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
        let view = self
            .view
            .as_ref()
            .ok_or(ChannelError::PartitionNotFound(self.partition_id))?;
        match view.poll_next() {
            Some(mut bl) => {
                bl.sequence_number = self.sequence_number;
                self.sequence_number = self.sequence_number.wrapping_add(1);
                Ok(Some(bl))
            }
            // An empty poll is only the end of the partition if the view
            // itself says no further data will ever arrive; otherwise it's
            // a transient gap the gate should simply wait out.
            None if view.is_finished() => Ok(Some(BufferAndBacklog {
                buffer: Buffer::unpooled(Vec::new()),
                data_type: DataType::EndOfPartition,
                buffers_in_backlog: 0,
                sequence_number: self.sequence_number,
            })),
            None => Ok(None),
        }
    }

    fn send_task_event(&mut self, _event_bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.view.is_some() {
            Ok(())
        } else {
            Err(ChannelError::ProducerUnavailable)
        }
    }

    fn resume_consumption(&mut self) {}

    fn release_all_resources(&mut self) {
        self.view = None;
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}
