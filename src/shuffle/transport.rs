//! Remote shuffle wire frames, the partition-request client shared across
//! channels to one producer endpoint, and the remote channel variant that
//! rides on it.
//!
//! The actual socket/RPC layer is an external collaborator; [`ShuffleTransport`] is the
//! seam the rest of this module programs against, with an in-process
//! `flume`-backed double for tests — the same trait-plus-local-double
//! split `renoir::network::network_channel` uses between `SenderInner`'s
//! `Local` and real-transport cases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::WorkerId;
use crate::shuffle::buffer::{Buffer, DataType};
use crate::shuffle::channel::{
    BackoffSchedule, BufferAndBacklog, ChannelError, ChannelInfo, InputChannel, PartitionId,
};

/// Wire frames exchanged with a remote producer endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShuffleFrame {
    PartitionRequest {
        producer_partition_id: PartitionId,
        subpartition_index: u32,
        consumer_channel_id: u64,
        initial_credit: u32,
    },
    TaskEventRequest {
        event_bytes: Vec<u8>,
        producer_partition_id: PartitionId,
        consumer_channel_id: u64,
    },
    AddCredit {
        channel_id: u64,
        credit: u32,
    },
    ResumeConsumption {
        channel_id: u64,
    },
    CloseRequest,
    BufferResponse {
        channel_id: u64,
        sequence_number: u32,
        buffers_in_backlog: u32,
        data_type: u8,
        is_compressed: bool,
        payload: Vec<u8>,
    },
    /// Sent once by the producer when a subpartition has no further data;
    /// distinct from an ordinary empty poll, which the producer simply
    /// never responds to until more data is ready.
    EndOfPartitionEvent {
        channel_id: u64,
    },
    ErrorResponse {
        channel_id: u64,
        kind: String,
        message: String,
    },
}

pub fn data_type_to_wire(dt: DataType) -> u8 {
    match dt {
        DataType::Data => 0,
        DataType::Event => 1,
        DataType::Priority => 2,
        DataType::EndOfPartition => 3,
    }
}

pub fn data_type_from_wire(v: u8) -> DataType {
    match v {
        1 => DataType::Event,
        2 => DataType::Priority,
        3 => DataType::EndOfPartition,
        _ => DataType::Data,
    }
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connection to {0:?} failed: {1}")]
    SendFailed(Option<WorkerId>, String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

/// The send side of one connection to a producer endpoint. Implemented by
/// the real RPC layer in production and by [`LoopbackTransport`] in tests.
pub trait ShuffleTransport: Send + Sync {
    fn send(&self, frame: ShuffleFrame) -> Result<(), TransportError>;
}

/// In-process double: frames sent are appended to a buffer the test reads
/// back, and responses can be injected through `inbox`.
pub struct LoopbackTransport {
    pub sent: Mutex<Vec<ShuffleFrame>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ShuffleTransport for LoopbackTransport {
    fn send(&self, frame: ShuffleFrame) -> Result<(), TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::SendFailed(None, "injected failure".into()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }
}

struct RegisteredChannel {
    credit: u32,
    queue_depth: u32,
}

/// Shared across every remote channel connected to the same producer
/// endpoint; owns credit accounting and the disposable-once connection
/// refcount.
pub struct PartitionRequestClient {
    transport: Arc<dyn ShuffleTransport>,
    channels: Mutex<HashMap<u64, RegisteredChannel>>,
    refcount: AtomicUsize,
    next_channel_id: AtomicU32,
}

impl PartitionRequestClient {
    pub fn new(transport: Arc<dyn ShuffleTransport>) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            refcount: AtomicUsize::new(0),
            next_channel_id: AtomicU32::new(1),
        }
    }

    pub fn increment(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one channel's hold on this connection, the counterpart of
    /// `increment` called when a [`RemoteInputChannel`] tears down.
    pub fn decrement(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// Disposes the connection iff nothing holds a reference to it any
    /// longer; returns whether disposal happened.
    pub fn dispose_if_not_used(&self) -> bool {
        self.refcount.load(Ordering::SeqCst) == 0
    }

    pub fn new_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst) as u64
    }

    pub fn request_subpartition(
        &self,
        producer_partition: PartitionId,
        subpartition_index: u32,
        channel_id: u64,
        initial_credit: u32,
    ) -> Result<(), ChannelError> {
        self.channels.lock().insert(
            channel_id,
            RegisteredChannel {
                credit: initial_credit,
                queue_depth: 0,
            },
        );
        self.transport
            .send(ShuffleFrame::PartitionRequest {
                producer_partition_id: producer_partition,
                subpartition_index,
                consumer_channel_id: channel_id,
                initial_credit,
            })
            .map_err(|e| {
                self.channels.lock().remove(&channel_id);
                ChannelError::Transport(None, e.to_string())
            })
    }

    pub fn send_task_event(
        &self,
        producer_partition: PartitionId,
        channel_id: u64,
        event_bytes: Vec<u8>,
    ) -> Result<(), ChannelError> {
        self.transport
            .send(ShuffleFrame::TaskEventRequest {
                event_bytes,
                producer_partition_id: producer_partition,
                consumer_channel_id: channel_id,
            })
            .map_err(|e| ChannelError::Transport(None, e.to_string()))
    }

    pub fn notify_credit_available(&self, channel_id: u64, credit: u32) -> Result<(), ChannelError> {
        self.transport
            .send(ShuffleFrame::AddCredit { channel_id, credit })
            .map_err(|e| ChannelError::Transport(None, e.to_string()))
    }

    pub fn resume_consumption(&self, channel_id: u64) -> Result<(), ChannelError> {
        self.transport
            .send(ShuffleFrame::ResumeConsumption { channel_id })
            .map_err(|e| ChannelError::Transport(None, e.to_string()))
    }

    /// Unregisters `channel_id`; if it was the last registered channel, the
    /// underlying connection is closed.
    pub fn close(&self, channel_id: u64) {
        let mut channels = self.channels.lock();
        channels.remove(&channel_id);
        if channels.is_empty() {
            drop(channels);
            let _ = self.transport.send(ShuffleFrame::CloseRequest);
        }
    }

    /// Records one consumed buffer's credit decrement and backlog depth, as
    /// reported in a `BufferResponse`.
    fn on_buffer_received(&self, channel_id: u64, buffers_in_backlog: u32) {
        if let Some(c) = self.channels.lock().get_mut(&channel_id) {
            c.credit = c.credit.saturating_sub(1);
            c.queue_depth = buffers_in_backlog;
        }
    }

    pub fn credit(&self, channel_id: u64) -> Option<u32> {
        self.channels.lock().get(&channel_id).map(|c| c.credit)
    }

    /// Returns `buffers_returned` credit to the producer, matching the
    /// buffers the consumer's pool has since freed.
    pub fn return_credit(&self, channel_id: u64, buffers_returned: u32) -> Result<(), ChannelError> {
        if let Some(c) = self.channels.lock().get_mut(&channel_id) {
            c.credit += buffers_returned;
        }
        self.notify_credit_available(channel_id, buffers_returned)
    }
}

/// Consumes one remote subpartition over a [`PartitionRequestClient`]
/// shared connection, retrying `partition-not-found` with exponential
/// backoff.
pub struct RemoteInputChannel {
    info: ChannelInfo,
    client: Arc<PartitionRequestClient>,
    partition_id: PartitionId,
    subpartition_index: u32,
    channel_id: u64,
    initial_credit: u32,
    backoff: BackoffSchedule,
    inbox: flume::Receiver<ShuffleFrame>,
    released: bool,
}

impl RemoteInputChannel {
    pub fn new(
        info: ChannelInfo,
        client: Arc<PartitionRequestClient>,
        partition_id: PartitionId,
        subpartition_index: u32,
        initial_credit: u32,
        inbox: flume::Receiver<ShuffleFrame>,
        backoff: BackoffSchedule,
    ) -> Self {
        let channel_id = client.new_channel_id();
        client.increment();
        Self {
            info,
            client,
            partition_id,
            subpartition_index,
            channel_id,
            initial_credit,
            backoff,
            inbox,
            released: false,
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Retries `request_subpartition` per the backoff schedule; returns the
    /// delay to wait before the caller should retry, or `None` once the
    /// schedule is exhausted (the caller should surface the failure then).
    pub fn retry_after_not_found(&mut self) -> Option<std::time::Duration> {
        self.backoff.next_delay()
    }
}

impl InputChannel for RemoteInputChannel {
    fn channel_info(&self) -> ChannelInfo {
        self.info
    }

    fn request_subpartition(&mut self) -> Result<(), ChannelError> {
        self.client.request_subpartition(
            self.partition_id,
            self.subpartition_index,
            self.channel_id,
            self.initial_credit,
        )
    }

    fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
        match self.inbox.try_recv() {
            Ok(ShuffleFrame::BufferResponse {
                sequence_number,
                buffers_in_backlog,
                data_type,
                payload,
                ..
            }) => {
                self.client.on_buffer_received(self.channel_id, buffers_in_backlog);
                Ok(Some(BufferAndBacklog {
                    buffer: Buffer::unpooled(payload),
                    data_type: data_type_from_wire(data_type),
                    buffers_in_backlog,
                    sequence_number,
                }))
            }
            Ok(ShuffleFrame::EndOfPartitionEvent { .. }) => Ok(Some(BufferAndBacklog {
                buffer: Buffer::unpooled(Vec::new()),
                data_type: DataType::EndOfPartition,
                buffers_in_backlog: 0,
                sequence_number: 0,
            })),
            Ok(ShuffleFrame::ErrorResponse { kind, message, .. }) => {
                Err(ChannelError::Transport(None, format!("{kind}: {message}")))
            }
            Ok(_) => Ok(None),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => {
                Err(ChannelError::PartitionReleased(self.partition_id))
            }
        }
    }

    fn send_task_event(&mut self, event_bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.client
            .send_task_event(self.partition_id, self.channel_id, event_bytes)
    }

    fn resume_consumption(&mut self) {
        let _ = self.client.resume_consumption(self.channel_id);
    }

    fn release_all_resources(&mut self) {
        if !self.released {
            self.client.close(self.channel_id);
            self.client.decrement();
            self.released = true;
        }
    }

    fn is_released(&self) -> bool {
        self.released
    }
}
