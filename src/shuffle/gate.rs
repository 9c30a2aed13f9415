//! Input gate: multiplexes N channels into one ordered stream.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::shuffle::buffer::DataType;
use crate::shuffle::channel::{seq_is_after, ChannelError, ChannelInfo, InputChannel};

/// One buffer (or priority event) handed back by the gate, tagged with its
/// originating channel.
pub struct GateEvent {
    pub channel: ChannelInfo,
    pub payload: Vec<u8>,
    pub data_type: DataType,
    pub buffers_in_backlog: u32,
    pub sequence_number: u32,
}

struct GateState {
    /// FIFO of channel indices known to currently have data, used by
    /// ordinary polls.
    available: VecDeque<usize>,
    /// Sub-FIFO that jumps the main queue; still delivered in
    /// per-channel sequence-number order. Priority buffers skip ahead of
    /// the ordinary FIFO but never reorder relative to each other.
    priority: VecDeque<usize>,
    /// Prevents double-enqueueing a channel already sitting in one of the
    /// two queues.
    queued: Vec<bool>,
    finished: Vec<bool>,
    closed: bool,
}

/// Aggregates channels behind a single blocking/non-blocking read surface.
pub struct InputGate {
    gate_index: u32,
    channels: Mutex<Vec<Box<dyn InputChannel>>>,
    state: Mutex<GateState>,
    non_empty: Condvar,
    last_priority_seq: Mutex<HashMap<usize, u32>>,
}

impl InputGate {
    pub fn new(gate_index: u32, channels: Vec<Box<dyn InputChannel>>) -> Self {
        let n = channels.len();
        Self {
            gate_index,
            channels: Mutex::new(channels),
            state: Mutex::new(GateState {
                available: VecDeque::new(),
                priority: VecDeque::new(),
                queued: vec![false; n],
                finished: vec![false; n],
                closed: false,
            }),
            non_empty: Condvar::new(),
            last_priority_seq: Mutex::new(HashMap::new()),
        }
    }

    pub fn gate_index(&self) -> u32 {
        self.gate_index
    }

    /// Called by the transport/notification fence once `index` has data to
    /// offer, enqueueing it (tail of the main FIFO, to keep channels
    /// served round-robin) and waking any blocked reader.
    pub fn notify_channel_nonempty(&self, index: usize) {
        let mut state = self.state.lock();
        if !state.queued[index] && !state.finished[index] {
            state.queued[index] = true;
            state.available.push_back(index);
            self.non_empty.notify_all();
        }
    }

    /// Called when a priority event (e.g. a checkpoint-barrier
    /// announcement) arrives on `index`; jumps the main queue. Stale or
    /// duplicate announcements — sequence number not strictly after the
    /// channel's last-seen priority sequence number, with overflow-aware
    /// comparison — are dropped.
    pub fn notify_priority_event(&self, index: usize, sequence_number: u32) -> bool {
        let mut last_seen = self.last_priority_seq.lock();
        if let Some(&prev) = last_seen.get(&index) {
            if !seq_is_after(sequence_number, prev) {
                return false; // stale/duplicate
            }
        }
        last_seen.insert(index, sequence_number);
        drop(last_seen);

        let mut state = self.state.lock();
        if !state.queued[index] && !state.finished[index] {
            state.queued[index] = true;
        }
        state.priority.push_back(index);
        self.non_empty.notify_all();
        true
    }

    fn pop_queue(state: &mut GateState) -> Option<usize> {
        state.priority.pop_front().or_else(|| state.available.pop_front())
    }

    /// Non-blocking poll: returns `None` if no channel currently has data
    /// (not necessarily finished).
    pub fn poll_next(&self) -> Result<Option<GateEvent>, ChannelError> {
        let index = {
            let mut state = self.state.lock();
            match Self::pop_queue(&mut state) {
                Some(i) => {
                    state.queued[i] = false;
                    i
                }
                None => return Ok(None),
            }
        };
        self.read_from(index)
    }

    /// Blocking poll: waits on the non-empty condition until a channel has
    /// data, the gate closes, or (conceptually) an interrupt — modeled here
    /// as the gate being closed from another thread. A channel reporting a
    /// transient empty read (no data right now, but not yet finished) is
    /// not terminal: the wait resumes rather than surfacing as stream end.
    pub fn get_next(&self) -> Result<Option<GateEvent>, ChannelError> {
        loop {
            let index = {
                let mut state = self.state.lock();
                loop {
                    if let Some(i) = Self::pop_queue(&mut state) {
                        state.queued[i] = false;
                        break i;
                    }
                    if state.closed || state.finished.iter().all(|&f| f) {
                        return Ok(None);
                    }
                    self.non_empty.wait(&mut state);
                }
            };
            if let Some(event) = self.read_from(index)? {
                return Ok(Some(event));
            }
            // Transient miss: the channel had nothing to deliver this round,
            // not end-of-partition. Go back to waiting for a notification.
        }
    }

    /// Reads one event from `index`. Returns `Ok(None)` only for a
    /// transient empty read; an `EndOfPartition`-tagged buffer is delivered
    /// through to the caller and marks the channel finished, it is never
    /// collapsed into `Ok(None)`.
    fn read_from(&self, index: usize) -> Result<Option<GateEvent>, ChannelError> {
        let mut channels = self.channels.lock();
        let channel = &mut channels[index];
        let info = channel.channel_info();
        match channel.get_next_buffer()? {
            Some(bl) => {
                let is_end_of_partition = bl.data_type == DataType::EndOfPartition;
                let more_available = bl.buffers_in_backlog > 0;
                drop(channels);
                if is_end_of_partition {
                    self.state.lock().finished[index] = true;
                } else if more_available {
                    self.notify_channel_nonempty(index);
                }
                Ok(Some(GateEvent {
                    channel: info,
                    payload: bl.buffer.payload().to_vec(),
                    data_type: bl.data_type,
                    buffers_in_backlog: bl.buffers_in_backlog,
                    sequence_number: bl.sequence_number,
                }))
            }
            None => Ok(None),
        }
    }

    /// `true` once every channel has signalled end-of-partition.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished.iter().all(|&f| f)
    }

    /// Idempotent close: subsequent reads yield empty.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for f in state.finished.iter_mut() {
            *f = true;
        }
        self.non_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::buffer::Buffer;
    use crate::shuffle::channel::BufferAndBacklog;
    use std::collections::VecDeque as Deque;

    struct StubChannel {
        info: ChannelInfo,
        queue: Deque<BufferAndBacklog>,
        released: bool,
    }

    impl InputChannel for StubChannel {
        fn channel_info(&self) -> ChannelInfo {
            self.info
        }
        fn request_subpartition(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
            Ok(self.queue.pop_front())
        }
        fn send_task_event(&mut self, _event_bytes: Vec<u8>) -> Result<(), ChannelError> {
            Ok(())
        }
        fn resume_consumption(&mut self) {}
        fn release_all_resources(&mut self) {
            self.released = true;
        }
        fn is_released(&self) -> bool {
            self.released
        }
    }

    fn bl(seq: u32, backlog: u32) -> BufferAndBacklog {
        BufferAndBacklog {
            buffer: Buffer::unpooled(vec![seq as u8]),
            data_type: DataType::Data,
            buffers_in_backlog: backlog,
            sequence_number: seq,
        }
    }

    #[test]
    fn poll_returns_none_when_nothing_queued() {
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue: Deque::new(),
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        assert!(gate.poll_next().unwrap().is_none());
    }

    #[test]
    fn backlog_reenqueues_channel_for_further_polls() {
        let mut queue = Deque::new();
        queue.push_back(bl(0, 1));
        queue.push_back(bl(1, 0));
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue,
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        gate.notify_channel_nonempty(0);
        let first = gate.poll_next().unwrap().unwrap();
        assert_eq!(first.sequence_number, 0);
        let second = gate.poll_next().unwrap().unwrap();
        assert_eq!(second.sequence_number, 1);
    }

    #[test]
    fn end_of_partition_buffer_marks_the_channel_finished() {
        let mut queue = Deque::new();
        queue.push_back(BufferAndBacklog {
            buffer: Buffer::unpooled(Vec::new()),
            data_type: DataType::EndOfPartition,
            buffers_in_backlog: 0,
            sequence_number: 0,
        });
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue,
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        gate.notify_channel_nonempty(0);
        let event = gate.poll_next().unwrap().unwrap();
        assert_eq!(event.data_type, DataType::EndOfPartition);
        assert!(gate.is_finished());
    }

    #[test]
    fn a_transient_empty_read_does_not_mark_the_channel_finished() {
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue: Deque::new(),
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        gate.notify_channel_nonempty(0);
        assert!(gate.poll_next().unwrap().is_none());
        assert!(!gate.is_finished());
    }

    #[test]
    fn stale_priority_notification_is_rejected() {
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue: Deque::new(),
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        assert!(gate.notify_priority_event(0, 10));
        assert!(!gate.notify_priority_event(0, 5));
        assert!(!gate.notify_priority_event(0, 10));
    }

    #[test]
    fn closing_the_gate_makes_get_next_return_empty() {
        let channel = Box::new(StubChannel {
            info: ChannelInfo { gate_index: 0, channel_index: 0 },
            queue: Deque::new(),
            released: false,
        });
        let gate = InputGate::new(0, vec![channel]);
        gate.close();
        assert!(gate.get_next().unwrap().is_none());
    }
}
